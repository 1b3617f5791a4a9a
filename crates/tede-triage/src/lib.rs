//! Innovation triage: keyword scan over materialized partitions, consolidation
//! and spreadsheet publication.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sheets_client::{SheetsClient, SheetsError};
use tede_storage::{PartitionStore, PartitionTable};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tede-triage";

/// Stock innovation vocabulary. Fragments are stems on purpose: "tecnolog"
/// matches "tecnologia", "tecnológica" and "tecnologias" alike.
pub const INNOVATION_FRAGMENTS: [&str; 24] = [
    "inova",
    "patente",
    "tecnolog",
    "protótipo",
    "produto",
    "process",
    "algoritmo",
    "método",
    "síntese",
    "software",
    "dispositivo",
    "bioativo",
    "aplica",
    "automa",
    "engenharia",
    "startup",
    "spin-off",
    "modelo",
    "composto",
    "diagnóstic",
    "biomaterial",
    "nano",
    "encapsul",
    "inteligência artificial",
];

/// Columns inspected for keyword hits.
pub const TRIAGE_COLUMNS: [&str; 3] = ["title", "keywords", "abstract"];

/// Provenance column appended to every published row.
pub const SOURCE_FILE_COLUMN: &str = "source_file";

/// Output header used when no partition contributed any match.
pub const CANONICAL_COLUMNS: [&str; 11] = [
    "year",
    "half",
    "reference_date",
    "title",
    "author",
    "advisor",
    "program",
    "keywords",
    "abstract",
    "link",
    "source_file",
];

pub const DEFAULT_TAB: &str = "Coleta";

#[derive(Debug, Clone, Deserialize)]
struct KeywordsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    fragments: Vec<String>,
}

/// Keyword fragments compiled into one case-insensitive alternation.
/// Fragments match as plain substrings; regex metacharacters in a fragment
/// are escaped, never interpreted.
#[derive(Debug, Clone)]
pub struct KeywordSet {
    fragments: Vec<String>,
    pattern: Regex,
}

impl KeywordSet {
    pub fn from_fragments(fragments: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let fragments: Vec<String> = fragments
            .into_iter()
            .map(|fragment| fragment.trim().to_string())
            .filter(|fragment| !fragment.is_empty())
            .collect();
        anyhow::ensure!(!fragments.is_empty(), "keyword set needs at least one fragment");

        let alternation = fragments
            .iter()
            .map(|fragment| regex::escape(fragment))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .build()
            .context("compiling keyword alternation")?;

        Ok(Self { fragments, pattern })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file: KeywordsFile = serde_yaml::from_str(
            &std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        Self::from_fragments(file.fragments)
    }

    pub fn default_innovation() -> Self {
        Self::from_fragments(INNOVATION_FRAGMENTS.iter().map(|s| (*s).to_string()))
            .expect("stock vocabulary always compiles")
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Rows of one partition that hit the vocabulary, with the partition's own
/// header retained for later column alignment.
#[derive(Debug, Clone)]
pub struct PartitionMatches {
    pub source_file: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub rows_scanned: usize,
}

/// Applies the vocabulary to the searchable columns of a partition.
#[derive(Debug, Clone)]
pub struct TriageFilter {
    keywords: KeywordSet,
}

impl TriageFilter {
    pub fn new(keywords: KeywordSet) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &KeywordSet {
        &self.keywords
    }

    /// Scan one partition. A row matches when any searchable column matches;
    /// a partition missing a searchable column is scanned as if that column
    /// were empty, with one warning per file.
    pub fn scan(&self, table: &PartitionTable) -> PartitionMatches {
        let mut indexes = Vec::new();
        for column in TRIAGE_COLUMNS {
            let index = table.columns.iter().position(|c| c == column);
            if index.is_none() {
                warn!(
                    partition = %table.name,
                    column,
                    "searchable column missing, treating as empty"
                );
            }
            indexes.push(index);
        }

        let rows: Vec<Vec<String>> = table
            .rows
            .iter()
            .filter(|row| {
                indexes.iter().copied().any(|index| {
                    index
                        .and_then(|i| row.get(i))
                        .map(|cell| self.keywords.is_match(cell))
                        .unwrap_or(false)
                })
            })
            .cloned()
            .collect();

        PartitionMatches {
            source_file: table.name.clone(),
            columns: table.columns.clone(),
            rows,
            rows_scanned: table.rows.len(),
        }
    }
}

/// Final dataset destined for the spreadsheet tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatedDataset {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ConsolidatedDataset {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Header plus data rows, the exact grid handed to the sink.
    pub fn to_grid(&self) -> Vec<Vec<String>> {
        let mut grid = Vec::with_capacity(self.rows.len() + 1);
        grid.push(self.columns.clone());
        grid.extend(self.rows.iter().cloned());
        grid
    }
}

/// Merge matched rows from every partition into one dataset.
///
/// Columns are the union of contributing partition headers in first-seen
/// order, with the provenance column always last. A partition lacking one of
/// the union columns contributes empty cells there; every cell is sanitized
/// on the way in. No matches at all yields the canonical header and no rows.
pub fn consolidate(matches: &[PartitionMatches]) -> ConsolidatedDataset {
    let mut columns: Vec<String> = Vec::new();
    for partition in matches {
        if partition.rows.is_empty() {
            continue;
        }
        for column in &partition.columns {
            if column != SOURCE_FILE_COLUMN && !columns.iter().any(|c| c == column) {
                columns.push(column.clone());
            }
        }
    }

    if columns.is_empty() {
        return ConsolidatedDataset {
            columns: CANONICAL_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        };
    }

    let mut rows = Vec::new();
    for partition in matches {
        if partition.rows.is_empty() {
            continue;
        }
        let lookup: Vec<Option<usize>> = columns
            .iter()
            .map(|column| partition.columns.iter().position(|c| c == column))
            .collect();
        for row in &partition.rows {
            let mut out = Vec::with_capacity(columns.len() + 1);
            for index in lookup.iter().copied() {
                let cell = index
                    .and_then(|i| row.get(i))
                    .map(String::as_str)
                    .unwrap_or("");
                out.push(sanitize_cell(cell));
            }
            out.push(partition.source_file.clone());
            rows.push(out);
        }
    }

    columns.push(SOURCE_FILE_COLUMN.to_string());
    ConsolidatedDataset { columns, rows }
}

/// Scrub one cell for publication. A value whose trimmed form parses as a
/// non-finite float (NaN, inf, -Infinity, overflow forms like 1e999) becomes
/// empty; everything else passes through verbatim. Idempotent.
pub fn sanitize_cell(cell: &str) -> String {
    let trimmed = cell.trim();
    if !trimmed.is_empty() {
        if let Ok(value) = trimmed.parse::<f64>() {
            if !value.is_finite() {
                return String::new();
            }
        }
    }
    cell.to_string()
}

/// Publish failure taxonomy. The two not-found variants are split out from
/// transport failures: they mean sharing or configuration is wrong, and a
/// retry with the same inputs cannot succeed.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("spreadsheet {spreadsheet_id} not found")]
    SpreadsheetNotFound { spreadsheet_id: String },
    #[error("tab {tab} not found in spreadsheet {spreadsheet_id}")]
    TabNotFound { spreadsheet_id: String, tab: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sheets(SheetsError),
}

/// Destination for the consolidated dataset. The spreadsheet tab is the
/// production implementation; tests capture the grid in memory.
#[async_trait]
pub trait TabSink: Send + Sync {
    async fn publish(&self, dataset: &ConsolidatedDataset) -> Result<(), SinkError>;
}

/// Publishes by replacing one spreadsheet tab wholesale: delete the old tab
/// if present, create a fresh one sized to the grid, then write the values.
pub struct SheetsTabSink {
    client: SheetsClient,
    spreadsheet_id: String,
    tab: String,
}

impl SheetsTabSink {
    pub fn new(
        client: SheetsClient,
        spreadsheet_id: impl Into<String>,
        tab: impl Into<String>,
    ) -> Self {
        Self {
            client,
            spreadsheet_id: spreadsheet_id.into(),
            tab: tab.into(),
        }
    }

    /// Classify an API failure. A 404 in this flow can only mean the
    /// spreadsheet id itself did not resolve; a range-parse rejection means
    /// the tab the values write addressed does not exist.
    fn classify(&self, error: SheetsError) -> SinkError {
        match error {
            SheetsError::Api { status: 404, .. } => SinkError::SpreadsheetNotFound {
                spreadsheet_id: self.spreadsheet_id.clone(),
            },
            SheetsError::Api {
                status: 400,
                message,
            } if message.contains("Unable to parse range") => SinkError::TabNotFound {
                spreadsheet_id: self.spreadsheet_id.clone(),
                tab: self.tab.clone(),
            },
            other => SinkError::Sheets(other),
        }
    }
}

#[async_trait]
impl TabSink for SheetsTabSink {
    async fn publish(&self, dataset: &ConsolidatedDataset) -> Result<(), SinkError> {
        match self
            .client
            .find_sheet_id(&self.spreadsheet_id, &self.tab)
            .await
            .map_err(|e| self.classify(e))?
        {
            Some(sheet_id) => {
                self.client
                    .delete_sheet(&self.spreadsheet_id, sheet_id)
                    .await
                    .map_err(|e| self.classify(e))?;
            }
            None => debug!(tab = %self.tab, "tab absent, nothing to delete"),
        }

        let grid = dataset.to_grid();
        let rows = grid.len().max(1) as u32;
        let cols = dataset.columns.len().max(1) as u32;
        self.client
            .add_sheet(&self.spreadsheet_id, &self.tab, rows, cols)
            .await
            .map_err(|e| self.classify(e))?;
        self.client
            .update_values(&self.spreadsheet_id, &format!("{}!A1", self.tab), grid)
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }
}

/// Environment-driven configuration for a triage run.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub csv_dir: PathBuf,
    pub keywords_file: Option<PathBuf>,
    pub spreadsheet_id: String,
    pub access_token: String,
    pub tab: String,
}

impl TriageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            csv_dir: std::env::var("TEDE_CSV_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("csvs")),
            keywords_file: std::env::var("TEDE_KEYWORDS_FILE").ok().map(PathBuf::from),
            spreadsheet_id: std::env::var("SHEETS_SPREADSHEET_ID")
                .context("SHEETS_SPREADSHEET_ID is required")?,
            access_token: std::env::var("SHEETS_ACCESS_TOKEN")
                .context("SHEETS_ACCESS_TOKEN is required")?,
            tab: std::env::var("SHEETS_TAB").unwrap_or_else(|_| DEFAULT_TAB.to_string()),
        })
    }
}

/// End-to-end summary of one triage run.
#[derive(Debug, Clone, Serialize)]
pub struct TriageRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partitions_scanned: usize,
    pub partitions_unreadable: usize,
    pub rows_scanned: usize,
    pub rows_matched: usize,
    pub columns_published: usize,
}

/// Triage stage: scan every partition, consolidate the matches, publish.
pub struct TriagePipeline {
    store: PartitionStore,
    filter: TriageFilter,
    sink: Box<dyn TabSink>,
}

impl TriagePipeline {
    pub fn new(store: PartitionStore, filter: TriageFilter, sink: Box<dyn TabSink>) -> Self {
        Self {
            store,
            filter,
            sink,
        }
    }

    /// Run one triage pass.
    ///
    /// A missing partition directory is fatal. A directory with no partitions
    /// still publishes the header-only dataset, and a partition that fails to
    /// read is logged and skipped rather than sinking the whole run.
    pub async fn run_once(&self) -> anyhow::Result<TriageRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let paths = self.store.list_partitions().await?;
        if paths.is_empty() {
            warn!("no partitions found, publishing headers only");
        }

        let mut matches = Vec::new();
        let mut partitions_unreadable = 0usize;
        let mut rows_scanned = 0usize;
        for path in &paths {
            let table = match self.store.read_partition(path).await {
                Ok(table) => table,
                Err(err) => {
                    warn!(
                        partition = %path.display(),
                        error = %err,
                        "skipping unreadable partition"
                    );
                    partitions_unreadable += 1;
                    continue;
                }
            };
            let scanned = self.filter.scan(&table);
            info!(
                partition = %scanned.source_file,
                matched = scanned.rows.len(),
                scanned = scanned.rows_scanned,
                "scanned partition"
            );
            rows_scanned += scanned.rows_scanned;
            matches.push(scanned);
        }

        let dataset = consolidate(&matches);
        let rows_matched = dataset.rows.len();
        let published = self.sink.publish(&dataset).await;
        if published.is_err() {
            if let Some((index, row)) = first_suspect_row(&dataset) {
                warn!(row = index, cells = ?row, "publish rejected, first suspect row");
            }
        }
        published.context("publishing consolidated dataset")?;

        let finished_at = Utc::now();
        let summary = TriageRunSummary {
            run_id,
            started_at,
            finished_at,
            partitions_scanned: paths.len() - partitions_unreadable,
            partitions_unreadable,
            rows_scanned,
            rows_matched,
            columns_published: dataset.columns.len(),
        };
        info!(%run_id, matched = rows_matched, "triage run finished");
        Ok(summary)
    }
}

/// Pick the row to surface when the transport rejects a publish: the first
/// row still carrying a non-finite numeric cell (a scrub gap), else the first
/// row at all.
fn first_suspect_row(dataset: &ConsolidatedDataset) -> Option<(usize, &[String])> {
    let scrub_gap = dataset.rows.iter().position(|row| {
        row.iter().any(|cell| {
            cell.trim()
                .parse::<f64>()
                .map(|value| !value.is_finite())
                .unwrap_or(false)
        })
    });
    match scrub_gap {
        Some(index) => Some((index, dataset.rows[index].as_slice())),
        None => dataset.rows.first().map(|row| (0, row.as_slice())),
    }
}

pub async fn run_triage_once_from_env() -> anyhow::Result<TriageRunSummary> {
    let config = TriageConfig::from_env()?;
    let keywords = match &config.keywords_file {
        Some(path) => KeywordSet::from_yaml_file(path)?,
        None => KeywordSet::default_innovation(),
    };
    let store = PartitionStore::new(&config.csv_dir);
    let sink = SheetsTabSink::new(
        SheetsClient::new(config.access_token.clone()),
        config.spreadsheet_id.clone(),
        config.tab.clone(),
    );
    let pipeline = TriagePipeline::new(store, TriageFilter::new(keywords), Box::new(sink));
    pipeline.run_once().await
}
