//! Write-once CSV partition storage for harvested TEDE records.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tede_core::{Bucket, Record};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tede-storage";

/// Byte-order mark written at the head of every partition file so spreadsheet
/// tools detect UTF-8.
pub const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Default partition file stem; files are named `{stem}_{year}_S{half}.csv`.
pub const DEFAULT_FILE_STEM: &str = "tede_uepb";

/// Outcome of one materialization pass over a harvested batch.
#[derive(Debug, Clone, Default)]
pub struct WriteSummary {
    pub written: Vec<String>,
    pub skipped: Vec<String>,
    pub dropped_unbucketed: usize,
    pub dropped_embargoed: usize,
}

/// One partition file loaded into memory. Rows may be ragged; consumers pair
/// cells with `columns` positionally.
#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
    file_stem: String,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_stem: DEFAULT_FILE_STEM.to_string(),
        }
    }

    pub fn with_file_stem(root: impl Into<PathBuf>, file_stem: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            file_stem: file_stem.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_file_name(&self, bucket: Bucket) -> String {
        format!("{}_{}.csv", self.file_stem, bucket)
    }

    /// Materialize one CSV per half-year bucket, skipping files that already
    /// exist. Partitions are write-once: presence on disk is the only
    /// idempotency signal, so existing files are never inspected or rewritten.
    pub async fn write(&self, records: &[Record], cutoff: Bucket) -> anyhow::Result<WriteSummary> {
        let mut summary = WriteSummary::default();
        let mut by_bucket: BTreeMap<Bucket, Vec<&Record>> = BTreeMap::new();

        for record in records {
            match record.bucket() {
                Some(bucket) if bucket.within_cutoff(cutoff) => {
                    by_bucket.entry(bucket).or_default().push(record);
                }
                Some(_) => summary.dropped_embargoed += 1,
                None => summary.dropped_unbucketed += 1,
            }
        }

        if summary.dropped_unbucketed > 0 {
            warn!(
                count = summary.dropped_unbucketed,
                "dropping records without a usable reference date"
            );
        }

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating partition directory {}", self.root.display()))?;

        for (bucket, bucket_records) in by_bucket {
            let file_name = self.partition_file_name(bucket);
            let path = self.root.join(&file_name);

            if fs::try_exists(&path)
                .await
                .with_context(|| format!("checking partition path {}", path.display()))?
            {
                info!(partition = %file_name, "partition already materialized, skipping");
                summary.skipped.push(file_name);
                continue;
            }

            let body = encode_partition(&bucket_records)?;
            if self.write_atomic(&path, &body).await? {
                info!(
                    partition = %file_name,
                    records = bucket_records.len(),
                    "materialized partition"
                );
                summary.written.push(file_name);
            } else {
                info!(partition = %file_name, "partition already materialized, skipping");
                summary.skipped.push(file_name);
            }
        }

        Ok(summary)
    }

    /// Write bytes through a temp file and rename. Returns `false` when the
    /// rename lost a race to another writer; the first materialization wins.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = path
            .parent()
            .expect("partition path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp partition file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp partition file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp partition file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(false)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp partition {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    /// List materialized partition files in lexicographic order; the naming
    /// scheme makes that chronological order as well.
    pub async fn list_partitions(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading partition directory {}", self.root.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading partition directory {}", self.root.display()))?
        {
            let path = entry.path();
            if path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("csv"))
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Read one partition file into memory, tolerating ragged rows and a
    /// leading byte-order mark.
    pub async fn read_partition(&self, path: &Path) -> anyhow::Result<PartitionTable> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading partition file {}", path.display()))?;
        let bytes = strip_bom(&bytes);

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
        let columns = reader
            .headers()
            .with_context(|| format!("reading partition header {}", path.display()))?
            .iter()
            .map(|header| header.to_string())
            .collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let row = result.with_context(|| format!("reading partition row {}", path.display()))?;
            rows.push(row.iter().map(|cell| cell.to_string()).collect());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(PartitionTable {
            name,
            columns,
            rows,
        })
    }
}

fn encode_partition(records: &[&Record]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&UTF8_BOM);
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        for record in records {
            writer.serialize(record).context("encoding partition row")?;
        }
        writer.flush().context("flushing partition encoder")?;
    }
    Ok(buf)
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&UTF8_BOM).unwrap_or(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tede_core::Semester;
    use tempfile::tempdir;

    fn sample_record(year: &str, half: &str, title: &str) -> Record {
        Record {
            year: year.to_string(),
            half: half.to_string(),
            reference_date: format!("{year}-01-15"),
            title: title.to_string(),
            author: "Silva, Ana".to_string(),
            advisor: "Souza, Bruno".to_string(),
            program: "Ciência e Tecnologia Ambiental".to_string(),
            keywords: "inovação; patente".to_string(),
            abstract_text: "Estudo sobre processos.".to_string(),
            link: "http://tede.example.edu/handle/1".to_string(),
        }
    }

    fn far_cutoff() -> Bucket {
        Bucket::new(2100, Semester::Second)
    }

    #[tokio::test]
    async fn partitions_are_write_once() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        let first = store
            .write(&[sample_record("2022", "1", "Original title")], far_cutoff())
            .await
            .expect("first write");
        assert_eq!(first.written, vec!["tede_uepb_2022_S1.csv"]);
        assert!(first.skipped.is_empty());

        let second = store
            .write(
                &[
                    sample_record("2022", "1", "Replacement title"),
                    sample_record("2022", "1", "Another row"),
                ],
                far_cutoff(),
            )
            .await
            .expect("second write");
        assert!(second.written.is_empty());
        assert_eq!(second.skipped, vec!["tede_uepb_2022_S1.csv"]);

        let table = store
            .read_partition(&dir.path().join("tede_uepb_2022_S1.csv"))
            .await
            .expect("read partition");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][3], "Original title");
    }

    #[tokio::test]
    async fn written_partitions_carry_utf8_bom_and_header() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        store
            .write(&[sample_record("2021", "2", "Any")], far_cutoff())
            .await
            .expect("write");

        let bytes = std::fs::read(dir.path().join("tede_uepb_2021_S2.csv")).expect("read bytes");
        assert_eq!(&bytes[..3], &UTF8_BOM);

        let text = String::from_utf8(bytes[3..].to_vec()).expect("utf-8 body");
        let header = text.lines().next().expect("header line");
        assert_eq!(header, Record::COLUMNS.join(","));
    }

    #[tokio::test]
    async fn cutoff_is_inclusive_and_drops_newer_buckets() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let cutoff = Bucket::new(2024, Semester::First);

        let summary = store
            .write(
                &[
                    sample_record("2023", "2", "Old enough"),
                    sample_record("2024", "1", "Exactly at cutoff"),
                    sample_record("2024", "2", "Still embargoed"),
                ],
                cutoff,
            )
            .await
            .expect("write");

        assert_eq!(
            summary.written,
            vec!["tede_uepb_2023_S2.csv", "tede_uepb_2024_S1.csv"]
        );
        assert_eq!(summary.dropped_embargoed, 1);
        assert!(!dir.path().join("tede_uepb_2024_S2.csv").exists());
    }

    #[tokio::test]
    async fn unbucketed_records_are_counted_and_dropped() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        let mut record = sample_record("2022", "1", "Fine");
        record.year = String::new();
        record.half = String::new();

        let summary = store
            .write(
                &[record, sample_record("2022", "1", "Kept")],
                far_cutoff(),
            )
            .await
            .expect("write");

        assert_eq!(summary.dropped_unbucketed, 1);
        assert_eq!(summary.written, vec!["tede_uepb_2022_S1.csv"]);

        let table = store
            .read_partition(&dir.path().join("tede_uepb_2022_S1.csv"))
            .await
            .expect("read partition");
        assert_eq!(table.rows.len(), 1);
    }

    #[tokio::test]
    async fn round_trip_preserves_accented_text() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        let mut record = sample_record("2020", "1", "Inovação tecnológica no semiárido");
        record.author = "Araújo, João".to_string();

        store.write(&[record], far_cutoff()).await.expect("write");

        let table = store
            .read_partition(&dir.path().join("tede_uepb_2020_S1.csv"))
            .await
            .expect("read partition");
        assert_eq!(table.name, "tede_uepb_2020_S1.csv");
        assert_eq!(table.columns, Record::COLUMNS);
        assert_eq!(table.rows[0][3], "Inovação tecnológica no semiárido");
        assert_eq!(table.rows[0][4], "Araújo, João");
    }

    #[tokio::test]
    async fn listing_is_sorted_and_csv_only() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());

        store
            .write(
                &[
                    sample_record("2023", "1", "c"),
                    sample_record("2021", "2", "a"),
                    sample_record("2022", "1", "b"),
                ],
                far_cutoff(),
            )
            .await
            .expect("write");
        std::fs::write(dir.path().join("notes.txt"), "not a partition").expect("stray file");

        let listed = store.list_partitions().await.expect("list");
        let names: Vec<_> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "tede_uepb_2021_S2.csv",
                "tede_uepb_2022_S1.csv",
                "tede_uepb_2023_S1.csv"
            ]
        );
    }

    #[tokio::test]
    async fn listing_errors_when_directory_is_missing() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path().join("never-created"));
        assert!(store.list_partitions().await.is_err());
    }

    #[tokio::test]
    async fn reading_tolerates_ragged_rows() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::new(dir.path());
        let path = dir.path().join("tede_uepb_2019_S1.csv");

        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"year,half,title\n2019,1,Short row\n2019\n");
        std::fs::write(&path, bytes).expect("write fixture");

        let table = store.read_partition(&path).await.expect("read partition");
        assert_eq!(table.columns, vec!["year", "half", "title"]);
        assert_eq!(table.rows[0], vec!["2019", "1", "Short row"]);
        assert_eq!(table.rows[1], vec!["2019"]);
    }
}
