//! OAI-PMH harvesting: paged ListRecords traversal, Dublin Core extraction
//! and partition materialization.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use tede_core::{Bucket, Record};
use tede_storage::{PartitionStore, WriteSummary};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tede-harvest";

pub const DEFAULT_ENDPOINT: &str = "https://tede.bc.uepb.edu.br/oai/request";
pub const DEFAULT_PAGE_DELAY_MS: u64 = 500;

/// One `<record>` element lifted out of a ListRecords response. Element text
/// is kept verbatim, in document order; empty values never make it in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    /// Header identifier, kept for diagnostics only.
    pub identifier: String,
    pub deleted: bool,
    pub titles: Vec<String>,
    pub creators: Vec<String>,
    pub contributors: Vec<String>,
    pub publishers: Vec<String>,
    pub subjects: Vec<String>,
    pub descriptions: Vec<String>,
    pub dates: Vec<String>,
    pub identifiers: Vec<String>,
}

/// One page of a ListRecords traversal. `resumption_token` is `None` when the
/// traversal is complete; upstream signals that with an absent or empty token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPage {
    pub entries: Vec<RawEntry>,
    pub resumption_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("xml parse failed: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("oai error {code}: {message}")]
    Protocol { code: String, message: String },
}

/// Paged record source. `OaiClient` is the production implementation; tests
/// script their own.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn first_page(&self) -> Result<RecordPage, HarvestError>;
    async fn next_page(&self, resumption_token: &str) -> Result<RecordPage, HarvestError>;
}

/// HTTP client for one OAI-PMH endpoint.
#[derive(Debug, Clone)]
pub struct OaiClient {
    client: reqwest::Client,
    endpoint: String,
}

impl OaiClient {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("tede-harvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_records(&self, params: &[(&str, &str)]) -> Result<RecordPage, HarvestError> {
        let response = self.client.get(&self.endpoint).query(params).send().await?;
        let status = response.status();
        let url = response.url().to_string();
        if !status.is_success() {
            return Err(HarvestError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.text().await?;
        parse_list_records(&body)
    }
}

#[async_trait]
impl RecordSource for OaiClient {
    async fn first_page(&self) -> Result<RecordPage, HarvestError> {
        self.list_records(&[("verb", "ListRecords"), ("metadataPrefix", "oai_dc")])
            .await
    }

    async fn next_page(&self, resumption_token: &str) -> Result<RecordPage, HarvestError> {
        self.list_records(&[("verb", "ListRecords"), ("resumptionToken", resumption_token)])
            .await
    }
}

/// Leaf element currently being captured while walking a response document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leaf {
    HeaderIdentifier,
    Title,
    Creator,
    Contributor,
    Publisher,
    Subject,
    Description,
    Date,
    Identifier,
    ResumptionToken,
    ProtocolError,
}

/// Parse one ListRecords response body.
///
/// Namespace prefixes are ignored; elements are matched by local name. The
/// header `<identifier>` and the Dublin Core `<dc:identifier>` share a local
/// name, so capture is gated on whether the cursor sits inside `<header>` or
/// `<metadata>`. A `noRecordsMatch` error means an empty traversal, every
/// other `<error>` code is fatal.
pub fn parse_list_records(xml: &str) -> Result<RecordPage, HarvestError> {
    let mut reader = Reader::from_str(xml);

    let mut page = RecordPage::default();
    let mut current: Option<RawEntry> = None;
    let mut in_header = false;
    let mut in_metadata = false;
    let mut leaf: Option<Leaf> = None;
    let mut error_code = String::new();
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let started = start_leaf(&e, in_header, in_metadata, current.is_some());
                match e.local_name().as_ref() {
                    b"record" => current = Some(RawEntry::default()),
                    b"header" => {
                        in_header = true;
                        if let Some(entry) = current.as_mut() {
                            if attr_value(&e, b"status")?.as_deref() == Some("deleted") {
                                entry.deleted = true;
                            }
                        }
                    }
                    b"metadata" => in_metadata = true,
                    b"error" => {
                        error_code = attr_value(&e, b"code")?.unwrap_or_default();
                    }
                    _ => {}
                }
                if let Some(started) = started {
                    leaf = Some(started);
                    text.clear();
                }
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                // An empty token element is the end-of-traversal marker.
                b"resumptionToken" => {}
                b"error" => {
                    let code = attr_value(&e, b"code")?.unwrap_or_default();
                    if code != "noRecordsMatch" {
                        return Err(HarvestError::Protocol {
                            code,
                            message: String::new(),
                        });
                    }
                    return Ok(RecordPage::default());
                }
                _ => {}
            },
            Event::Text(t) => {
                if leaf.is_some() {
                    text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if leaf.is_some() {
                    text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"record" => {
                    if let Some(entry) = current.take() {
                        page.entries.push(entry);
                    }
                }
                b"header" => in_header = false,
                b"metadata" => in_metadata = false,
                name => {
                    let Some(active) = leaf else { continue };
                    if !leaf_matches(active, name) {
                        continue;
                    }
                    leaf = None;
                    let value = text.trim();
                    match active {
                        Leaf::ResumptionToken => {
                            if !value.is_empty() {
                                page.resumption_token = Some(value.to_string());
                            }
                        }
                        Leaf::ProtocolError => {
                            if error_code == "noRecordsMatch" {
                                return Ok(RecordPage::default());
                            }
                            return Err(HarvestError::Protocol {
                                code: std::mem::take(&mut error_code),
                                message: value.to_string(),
                            });
                        }
                        other => {
                            if value.is_empty() {
                                continue;
                            }
                            if let Some(entry) = current.as_mut() {
                                commit_leaf(entry, other, value);
                            }
                        }
                    }
                }
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(page)
}

fn start_leaf(e: &BytesStart<'_>, in_header: bool, in_metadata: bool, in_record: bool) -> Option<Leaf> {
    match e.local_name().as_ref() {
        b"identifier" if in_header => Some(Leaf::HeaderIdentifier),
        b"title" if in_metadata => Some(Leaf::Title),
        b"creator" if in_metadata => Some(Leaf::Creator),
        b"contributor" if in_metadata => Some(Leaf::Contributor),
        b"publisher" if in_metadata => Some(Leaf::Publisher),
        b"subject" if in_metadata => Some(Leaf::Subject),
        b"description" if in_metadata => Some(Leaf::Description),
        b"date" if in_metadata => Some(Leaf::Date),
        b"identifier" if in_metadata => Some(Leaf::Identifier),
        b"resumptionToken" if !in_record => Some(Leaf::ResumptionToken),
        b"error" if !in_record => Some(Leaf::ProtocolError),
        _ => None,
    }
}

fn leaf_matches(leaf: Leaf, end_name: &[u8]) -> bool {
    let expected: &[u8] = match leaf {
        Leaf::HeaderIdentifier | Leaf::Identifier => b"identifier",
        Leaf::Title => b"title",
        Leaf::Creator => b"creator",
        Leaf::Contributor => b"contributor",
        Leaf::Publisher => b"publisher",
        Leaf::Subject => b"subject",
        Leaf::Description => b"description",
        Leaf::Date => b"date",
        Leaf::ResumptionToken => b"resumptionToken",
        Leaf::ProtocolError => b"error",
    };
    end_name == expected
}

fn commit_leaf(entry: &mut RawEntry, leaf: Leaf, value: &str) {
    let value = value.to_string();
    match leaf {
        Leaf::HeaderIdentifier => entry.identifier = value,
        Leaf::Title => entry.titles.push(value),
        Leaf::Creator => entry.creators.push(value),
        Leaf::Contributor => entry.contributors.push(value),
        Leaf::Publisher => entry.publishers.push(value),
        Leaf::Subject => entry.subjects.push(value),
        Leaf::Description => entry.descriptions.push(value),
        Leaf::Date => entry.dates.push(value),
        Leaf::Identifier => entry.identifiers.push(value),
        Leaf::ResumptionToken | Leaf::ProtocolError => {}
    }
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, HarvestError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.local_name().as_ref() == name {
            let value = attr.unescape_value()?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Map one harvested entry to a partition record.
///
/// Multi-valued elements join with `"; "`. The reference date is the last
/// `<dc:date>`; the abstract is the first `<dc:description>`; the link is the
/// first http identifier. An unusable reference date leaves year and half
/// empty, which the partition writer drops later.
pub fn extract_record(entry: &RawEntry) -> Record {
    let reference_date = entry.dates.last().cloned().unwrap_or_default();
    let (year, half) = match Bucket::from_raw_date(&reference_date) {
        Some(bucket) => (bucket.year.to_string(), bucket.half.to_string()),
        None => (String::new(), String::new()),
    };

    Record {
        year,
        half,
        reference_date,
        title: entry.titles.join("; "),
        author: entry.creators.join("; "),
        advisor: join_advisors(&entry.contributors),
        program: entry.publishers.join("; "),
        keywords: entry.subjects.join("; "),
        abstract_text: entry.descriptions.first().cloned().unwrap_or_default(),
        link: entry
            .identifiers
            .iter()
            .find(|id| id.starts_with("http"))
            .cloned()
            .unwrap_or_default(),
    }
}

/// Contributor lists mix advisor names with CPF registry entries and Lattes
/// profile URLs; only the names survive.
fn join_advisors(values: &[String]) -> String {
    values
        .iter()
        .filter(|v| !v.starts_with("CPF") && !v.starts_with("http"))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Walks a paged traversal to completion, accumulating every entry.
#[derive(Debug, Clone)]
pub struct Harvester {
    page_delay: Duration,
}

impl Harvester {
    pub fn new(page_delay: Duration) -> Self {
        Self { page_delay }
    }

    /// Fetch every page of the traversal. The delay applies before follow-up
    /// pages only; any page error aborts the whole harvest.
    pub async fn fetch_all(&self, source: &dyn RecordSource) -> Result<Vec<RawEntry>, HarvestError> {
        let mut entries = Vec::new();
        let mut page = source.first_page().await?;
        let mut pages = 1usize;

        loop {
            let RecordPage {
                entries: batch,
                resumption_token,
            } = page;
            entries.extend(batch);

            let Some(token) = resumption_token else {
                break;
            };
            debug!(pages, "following resumption token");
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }
            page = source.next_page(&token).await?;
            pages += 1;
        }

        info!(pages, entries = entries.len(), "harvest traversal complete");
        Ok(entries)
    }
}

/// Environment-driven configuration for a harvest run.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub endpoint: String,
    pub csv_dir: PathBuf,
    pub page_delay: Duration,
}

impl HarvestConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint =
            std::env::var("TEDE_OAI_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let csv_dir = std::env::var("TEDE_CSV_DIR").unwrap_or_else(|_| "csvs".to_string());
        let page_delay_ms = match std::env::var("TEDE_PAGE_DELAY_MS") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("parsing TEDE_PAGE_DELAY_MS={raw}"))?,
            Err(_) => DEFAULT_PAGE_DELAY_MS,
        };
        Ok(Self {
            endpoint,
            csv_dir: PathBuf::from(csv_dir),
            page_delay: Duration::from_millis(page_delay_ms),
        })
    }
}

/// End-to-end summary of one harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff: String,
    pub entries_harvested: usize,
    pub deleted_skipped: usize,
    pub partitions_written: Vec<String>,
    pub partitions_skipped: Vec<String>,
    pub records_dropped_unbucketed: usize,
    pub records_dropped_embargoed: usize,
}

/// Harvest stage: traverse the full source, then materialize every eligible
/// half-year partition.
pub struct HarvestPipeline<S: RecordSource> {
    source: S,
    harvester: Harvester,
    store: PartitionStore,
}

impl<S: RecordSource> HarvestPipeline<S> {
    pub fn new(source: S, harvester: Harvester, store: PartitionStore) -> Self {
        Self {
            source,
            harvester,
            store,
        }
    }

    /// Run one harvest. An empty harvest leaves the partition store untouched;
    /// an upstream outage must not materialize empty history.
    pub async fn run_once(&self, reference_date: NaiveDate) -> anyhow::Result<HarvestRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cutoff = Bucket::cutoff_for(reference_date);
        info!(%run_id, cutoff = %cutoff, "starting harvest run");

        let entries = self
            .harvester
            .fetch_all(&self.source)
            .await
            .context("harvesting records")?;

        let mut records = Vec::new();
        let mut deleted_skipped = 0usize;
        for entry in &entries {
            if entry.deleted {
                deleted_skipped += 1;
                continue;
            }
            records.push(extract_record(entry));
        }

        let write = if records.is_empty() {
            warn!("harvest produced no live records, leaving the partition store untouched");
            WriteSummary::default()
        } else {
            self.store
                .write(&records, cutoff)
                .await
                .context("materializing partitions")?
        };

        let finished_at = Utc::now();
        let summary = HarvestRunSummary {
            run_id,
            started_at,
            finished_at,
            cutoff: cutoff.to_string(),
            entries_harvested: entries.len(),
            deleted_skipped,
            partitions_written: write.written,
            partitions_skipped: write.skipped,
            records_dropped_unbucketed: write.dropped_unbucketed,
            records_dropped_embargoed: write.dropped_embargoed,
        };
        info!(
            %run_id,
            written = summary.partitions_written.len(),
            skipped = summary.partitions_skipped.len(),
            "harvest run finished"
        );
        Ok(summary)
    }
}

pub async fn run_harvest_once_from_env() -> anyhow::Result<HarvestRunSummary> {
    let config = HarvestConfig::from_env()?;
    let client = OaiClient::new(&config.endpoint)?;
    info!(endpoint = client.endpoint(), "harvesting OAI-PMH endpoint");
    let pipeline = HarvestPipeline::new(
        client,
        Harvester::new(config.page_delay),
        PartitionStore::new(&config.csv_dir),
    );
    pipeline.run_once(Utc::now().date_naive()).await
}
