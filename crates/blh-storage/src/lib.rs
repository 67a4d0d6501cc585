//! Control-list and dataset persistence + HTTP fetch utilities.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use blh_core::{ListingRecord, SourceEntry};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "blh-storage";

/// Write bytes next to `path` under a temp name, then rename into place, so a
/// crash mid-write never leaves a truncated artifact behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    fs::write(&temp_path, bytes)
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;

    match fs::rename(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

fn to_csv_bytes<T: serde::Serialize>(rows: &[T]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {err}"))
}

/// Read the operator control list. A malformed or missing file is a hard
/// error; there is nothing sensible to scrape without it.
pub fn load_control_list(path: &Path) -> anyhow::Result<Vec<SourceEntry>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("reading control list {}", path.display()))?;
    let mut entries = Vec::new();
    for row in reader.deserialize() {
        let entry: SourceEntry =
            row.with_context(|| format!("parsing control list row in {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

pub fn save_control_list(path: &Path, entries: &[SourceEntry]) -> anyhow::Result<()> {
    let bytes = to_csv_bytes(entries)?;
    write_atomic(path, &bytes)
        .with_context(|| format!("saving control list {}", path.display()))
}

/// Load a listing dataset; the file must exist.
pub fn load_records(path: &Path) -> anyhow::Result<Vec<ListingRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("reading dataset {}", path.display()))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: ListingRecord =
            row.with_context(|| format!("parsing dataset row in {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}

/// Load the master dataset, treating an absent file as an empty history.
pub fn load_master(path: &Path) -> anyhow::Result<Vec<ListingRecord>> {
    if !path.exists() {
        warn!(path = %path.display(), "master dataset not found, starting empty");
        return Ok(Vec::new());
    }
    load_records(path)
}

pub fn save_master(path: &Path, records: &[ListingRecord]) -> anyhow::Result<()> {
    let bytes = to_csv_bytes(records)?;
    write_atomic(path, &bytes).with_context(|| format!("saving master dataset {}", path.display()))
}

pub fn snapshot_path(dir: &Path, period: &str) -> PathBuf {
    dir.join(format!("{period}_listings.csv"))
}

/// Persist one run's newly scraped records as a period-stamped artifact.
pub fn write_snapshot(
    dir: &Path,
    period: &str,
    records: &[ListingRecord],
) -> anyhow::Result<PathBuf> {
    let path = snapshot_path(dir, period);
    let bytes = to_csv_bytes(records)?;
    write_atomic(&path, &bytes)
        .with_context(|| format!("writing run snapshot {}", path.display()))?;
    Ok(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: BTreeMap<String, String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: BTreeMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client. Sources are fetched one at a time, so the only
/// throttling here is the per-request timeout and the retry backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name `{name}`"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for `{name:?}`"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    pub async fn fetch_text(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        let response = self.fetch(source_id, url).await?;
        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blh_core::{columns, normalize_rows, RawRow, RunStatus, TabularResult};
    use tempfile::tempdir;

    fn mk_entry(site_name: &str, opted_in: bool) -> SourceEntry {
        SourceEntry {
            site_name: site_name.to_string(),
            listing_url: format!("https://{}.example/listings", site_name.to_lowercase()),
            base_url: format!("https://{}.example", site_name.to_lowercase()),
            contact_name: "Pat Doe".to_string(),
            contact_number: "555-0100".to_string(),
            mode: Some("default".to_string()),
            opted_in,
            status: None,
            count: None,
        }
    }

    fn mk_record(broker: &str, link: &str) -> ListingRecord {
        let row: RawRow = [
            (columns::BROKER_NAME, broker),
            (columns::DEAL_LINK, link),
            (columns::LISTING_ID, "L-77"),
            (columns::PUBLISHED_DATE, "2025-07-04"),
            (columns::LISTING_NAME, "Industrial Bakery"),
            (columns::STATUS, "Available"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        normalize_rows(&TabularResult::from_rows(vec![row])).remove(0)
    }

    #[test]
    fn control_list_round_trips_including_flags() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sitelist.csv");

        let mut entries = vec![mk_entry("Acme", true), mk_entry("Beta", false)];
        entries[0].status = Some(RunStatus::Success);
        entries[0].count = Some(3);

        save_control_list(&path, &entries).expect("save");
        let loaded = load_control_list(&path).expect("load");
        assert_eq!(loaded, entries);

        let text = fs::read_to_string(&path).expect("read raw");
        assert!(text.contains("TRUE"));
        assert!(text.contains("FALSE"));
        assert!(text.contains("success"));
    }

    #[test]
    fn control_list_accepts_blank_status_and_count() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sitelist.csv");
        fs::write(
            &path,
            "Site Name,Listing URL,Base URL,Contact Name,Contact Number,mode,to_scrape,Status,Count\n\
             Acme Brokers,https://acme.example/deals,https://acme.example,Pat,555-0100,default,true,,\n",
        )
        .expect("write raw");

        let entries = load_control_list(&path).expect("load");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].opted_in);
        assert_eq!(entries[0].status, None);
        assert_eq!(entries[0].count, None);
    }

    #[test]
    fn absent_master_loads_as_empty_history() {
        let dir = tempdir().expect("tempdir");
        let records = load_master(&dir.path().join("missing.csv")).expect("load");
        assert!(records.is_empty());
    }

    #[test]
    fn master_round_trips_with_exact_columns() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("master_listings.csv");
        let records = vec![
            mk_record("Acme", "https://acme.example/deals/1"),
            mk_record("Beta", "https://beta.example/deals/9"),
        ];

        save_master(&path, &records).expect("save");
        let loaded = load_master(&path).expect("load");
        assert_eq!(loaded, records);

        let header = fs::read_to_string(&path)
            .expect("read raw")
            .lines()
            .next()
            .map(ToString::to_string)
            .expect("header line");
        for column in columns::ALL {
            assert!(header.contains(column), "missing column {column}");
        }
    }

    #[test]
    fn snapshot_is_named_by_period() {
        let dir = tempdir().expect("tempdir");
        let path = write_snapshot(dir.path(), "2025-08", &[mk_record("Acme", "https://a/1")])
            .expect("write");
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("2025-08_listings.csv")
        );
        assert!(path.exists());
    }

    #[test]
    fn atomic_write_replaces_existing_artifact_without_temp_leftovers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("master_listings.csv");

        save_master(&path, &[mk_record("Acme", "https://a/1")]).expect("first save");
        save_master(&path, &[mk_record("Beta", "https://b/2")]).expect("second save");

        let loaded = load_master(&path).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].broker_name, "Beta");

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn fetcher_rejects_malformed_default_headers() {
        let config = HttpClientConfig {
            default_headers: [("Bad Header Name".to_string(), "x".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        assert!(HttpFetcher::new(config).is_err());
    }
}
