use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tede-cli")]
#[command(about = "TEDE harvest and innovation triage command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Harvest,
    Triage,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tede=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => {
            let summary = tede_harvest::run_harvest_once_from_env().await?;
            println!(
                "harvest complete: run_id={} cutoff={} entries={} written={} skipped={}",
                summary.run_id,
                summary.cutoff,
                summary.entries_harvested,
                summary.partitions_written.len(),
                summary.partitions_skipped.len()
            );
        }
        Commands::Triage => {
            let summary = tede_triage::run_triage_once_from_env().await?;
            println!(
                "triage complete: run_id={} partitions={} matched={} columns={}",
                summary.run_id,
                summary.partitions_scanned,
                summary.rows_matched,
                summary.columns_published
            );
        }
    }

    Ok(())
}
