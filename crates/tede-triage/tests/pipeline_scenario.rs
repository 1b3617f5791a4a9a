//! End-to-end triage runs over real partition files in a temp directory.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tede_core::{Bucket, Record, Semester};
use tede_storage::{PartitionStore, UTF8_BOM};
use tede_triage::{
    ConsolidatedDataset, KeywordSet, SinkError, TabSink, TriageFilter, TriagePipeline,
    CANONICAL_COLUMNS,
};

struct CapturingSink {
    captured: Arc<Mutex<Option<ConsolidatedDataset>>>,
}

#[async_trait]
impl TabSink for CapturingSink {
    async fn publish(&self, dataset: &ConsolidatedDataset) -> Result<(), SinkError> {
        *self.captured.lock().expect("sink lock") = Some(dataset.clone());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl TabSink for FailingSink {
    async fn publish(&self, _dataset: &ConsolidatedDataset) -> Result<(), SinkError> {
        Err(SinkError::Message(
            "spreadsheet rejected the update".to_string(),
        ))
    }
}

fn record(
    year: &str,
    half: &str,
    title: &str,
    keywords: &str,
    abstract_text: &str,
) -> Record {
    let month = if half == "1" { "03" } else { "08" };
    Record {
        year: year.to_string(),
        half: half.to_string(),
        reference_date: format!("{year}-{month}-15"),
        title: title.to_string(),
        author: "Silva, Ana".to_string(),
        advisor: "Souza, Bruno".to_string(),
        program: "Desenvolvimento Regional".to_string(),
        keywords: keywords.to_string(),
        abstract_text: abstract_text.to_string(),
        link: format!("http://tede.example.edu/handle/{year}{half}"),
    }
}

fn pipeline_with_capture(
    store: PartitionStore,
) -> (TriagePipeline, Arc<Mutex<Option<ConsolidatedDataset>>>) {
    let captured = Arc::new(Mutex::new(None));
    let sink = CapturingSink {
        captured: Arc::clone(&captured),
    };
    let pipeline = TriagePipeline::new(
        store,
        TriageFilter::new(KeywordSet::default_innovation()),
        Box::new(sink),
    );
    (pipeline, captured)
}

#[tokio::test]
async fn triage_consolidates_matches_across_partitions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PartitionStore::new(dir.path());

    // Two partitions materialized through the store itself.
    store
        .write(
            &[
                record(
                    "2021",
                    "2",
                    "Síntese de compostos bioativos",
                    "química; semiárido",
                    "Ensaios laboratoriais.",
                ),
                record(
                    "2021",
                    "2",
                    "Memórias do cariri oriental",
                    "história; cultura",
                    "Relato de trajetórias docentes.",
                ),
                record(
                    "2022",
                    "1",
                    "Currículo e avaliação escolar",
                    "software educacional; ensino",
                    "Análise de uso em sala.",
                ),
                record(
                    "2022",
                    "1",
                    "Festas juninas do agreste",
                    "cultura popular",
                    "Etnografia das quadrilhas.",
                ),
            ],
            Bucket::new(2100, Semester::Second),
        )
        .await
        .expect("materialize partitions");

    // One legacy partition written by hand with a narrower header and a
    // pandas-style nan marker.
    let mut legacy = UTF8_BOM.to_vec();
    legacy.extend_from_slice(
        b"year,half,title,keywords\n\
          2020,1,Registro de patente verde,nan\n\
          2020,1,Leitura na escola,leitura\n",
    );
    std::fs::write(dir.path().join("tede_uepb_2020_S1.csv"), legacy).expect("legacy partition");

    let (pipeline, captured) = pipeline_with_capture(store);
    let summary = pipeline.run_once().await.expect("triage run");

    assert_eq!(summary.partitions_scanned, 3);
    assert_eq!(summary.partitions_unreadable, 0);
    assert_eq!(summary.rows_scanned, 6);
    assert_eq!(summary.rows_matched, 3);
    assert_eq!(summary.columns_published, 11);

    let dataset = captured
        .lock()
        .expect("sink lock")
        .take()
        .expect("dataset published");

    // Legacy partition sorts first, so its columns seed the union.
    assert_eq!(
        dataset.columns,
        vec![
            "year",
            "half",
            "title",
            "keywords",
            "reference_date",
            "author",
            "advisor",
            "program",
            "abstract",
            "link",
            "source_file",
        ]
    );

    assert_eq!(
        dataset.rows[0],
        vec![
            "2020",
            "1",
            "Registro de patente verde",
            "",
            "",
            "",
            "",
            "",
            "",
            "",
            "tede_uepb_2020_S1.csv",
        ]
    );
    assert_eq!(
        dataset.rows[1],
        vec![
            "2021",
            "2",
            "Síntese de compostos bioativos",
            "química; semiárido",
            "2021-08-15",
            "Silva, Ana",
            "Souza, Bruno",
            "Desenvolvimento Regional",
            "Ensaios laboratoriais.",
            "http://tede.example.edu/handle/20212",
            "tede_uepb_2021_S2.csv",
        ]
    );
    assert_eq!(dataset.rows[2][2], "Currículo e avaliação escolar");
    assert_eq!(dataset.rows[2][10], "tede_uepb_2022_S1.csv");
}

#[tokio::test]
async fn empty_directory_publishes_header_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PartitionStore::new(dir.path());

    let (pipeline, captured) = pipeline_with_capture(store);
    let summary = pipeline.run_once().await.expect("triage run");

    assert_eq!(summary.partitions_scanned, 0);
    assert_eq!(summary.rows_matched, 0);

    let dataset = captured
        .lock()
        .expect("sink lock")
        .take()
        .expect("dataset published");
    assert_eq!(dataset.columns, CANONICAL_COLUMNS);
    assert!(dataset.is_empty());
}

#[tokio::test]
async fn unreadable_partition_is_skipped_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PartitionStore::new(dir.path());

    store
        .write(
            &[record(
                "2021",
                "1",
                "Protótipo de coletor solar",
                "energia",
                "Testes de campo.",
            )],
            Bucket::new(2100, Semester::Second),
        )
        .await
        .expect("materialize partition");
    // UTF-16 bytes are not decodable as UTF-8, so this partition fails to read.
    std::fs::write(
        dir.path().join("tede_uepb_2018_S1.csv"),
        [0xFF, 0xFE, b't', 0x00],
    )
    .expect("corrupt partition");

    let (pipeline, captured) = pipeline_with_capture(store);
    let summary = pipeline.run_once().await.expect("triage run");

    assert_eq!(summary.partitions_scanned, 1);
    assert_eq!(summary.partitions_unreadable, 1);
    assert_eq!(summary.rows_matched, 1);

    let dataset = captured
        .lock()
        .expect("sink lock")
        .take()
        .expect("dataset published");
    assert_eq!(dataset.rows[0][3], "Protótipo de coletor solar");
}

#[tokio::test]
async fn missing_partition_directory_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PartitionStore::new(dir.path().join("never-created"));

    let (pipeline, _captured) = pipeline_with_capture(store);
    assert!(pipeline.run_once().await.is_err());
}

#[tokio::test]
async fn sink_failure_fails_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PartitionStore::new(dir.path());

    let pipeline = TriagePipeline::new(
        store,
        TriageFilter::new(KeywordSet::default_innovation()),
        Box::new(FailingSink),
    );

    let error = pipeline.run_once().await.expect_err("publish must fail");
    assert!(error.to_string().contains("publishing consolidated dataset"));
}
