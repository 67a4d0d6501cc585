//! Run orchestration: per-source execution, dedup merge, status reporting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blh_adapters::{AdapterRegistry, ScrapeConfig, SourceAdapter};
use blh_core::{
    dedupe_last_wins, normalize_rows, period_token, phase_token, IdentityKey, ListingRecord,
    RunStatus, SourceEntry, TabularResult,
};
use blh_storage::{HttpClientConfig, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "blh-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub control_list_path: PathBuf,
    pub master_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            control_list_path: std::env::var("BLH_SITELIST")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sitelist.csv")),
            master_path: std::env::var("BLH_MASTER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("master_listings.csv")),
            snapshot_dir: std::env::var("BLH_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("BLH_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36"
                    .to_string()
            }),
            http_timeout_secs: std::env::var("BLH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("BLH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("BLH_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 1 * *".to_string()),
        }
    }
}

/// Per-source result of one run, keyed by source name so status updates never
/// depend on row position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_name: String,
    pub status: RunStatus,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: String,
    pub period: String,
    pub sources_total: usize,
    pub new_listings: usize,
    pub master_rows: usize,
    pub snapshot_path: Option<PathBuf>,
    pub outcomes: Vec<SourceOutcome>,
    pub persistence_errors: Vec<String>,
}

/// Sole owner of the master dataset for the duration of a run.
#[derive(Debug, Default)]
pub struct MergeStore {
    master: Vec<ListingRecord>,
}

impl MergeStore {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            master: blh_storage::load_master(path)?,
        })
    }

    pub fn from_records(master: Vec<ListingRecord>) -> Self {
        Self { master }
    }

    pub fn records(&self) -> &[ListingRecord] {
        &self.master
    }

    pub fn len(&self) -> usize {
        self.master.len()
    }

    pub fn is_empty(&self) -> bool {
        self.master.is_empty()
    }

    /// This broker's prior rows, projected to the identity-key columns.
    pub fn history_for(&self, broker_name: &str) -> Vec<IdentityKey> {
        self.master
            .iter()
            .filter(|record| record.broker_name == broker_name)
            .map(ListingRecord::identity_key)
            .collect()
    }

    /// Fold one run's records into the master, newest version winning on
    /// identity-key collision. Returns the run snapshot, or `None` when there
    /// was nothing to merge.
    pub fn merge(&mut self, new_records: Vec<ListingRecord>) -> Option<Vec<ListingRecord>> {
        if new_records.is_empty() {
            info!("no new listings this run, master dataset left untouched");
            return None;
        }
        let mut combined = std::mem::take(&mut self.master);
        combined.extend(new_records.iter().cloned());
        self.master = dedupe_last_wins(combined);
        Some(new_records)
    }
}

/// Assemble the immutable per-source configuration from a control-list row
/// and the broker's slice of history.
pub fn build_scrape_config(
    entry: &SourceEntry,
    store: &MergeStore,
    phase: &str,
    headers: &BTreeMap<String, String>,
) -> ScrapeConfig {
    ScrapeConfig {
        listing_url: entry.listing_url.clone(),
        base_url: entry.base_url.clone(),
        headers: headers.clone(),
        history: store.history_for(&entry.site_name),
        broker_name: entry.site_name.clone(),
        phase: phase.to_string(),
        mode: entry.mode.clone().unwrap_or_else(|| "default".to_string()),
        contact_name: entry.contact_name.clone(),
        contact_number: entry.contact_number.clone(),
    }
}

/// Write run outcomes back onto control-list entries, matched by source name.
pub fn apply_outcomes(entries: &mut [SourceEntry], outcomes: &[SourceOutcome]) {
    for outcome in outcomes {
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.site_name == outcome.source_name)
        {
            entry.status = Some(outcome.status);
            entry.count = Some(outcome.count);
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: AdapterRegistry,
    http: Arc<HttpFetcher>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: AdapterRegistry) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            config,
            registry,
            http: Arc::new(http),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Process every control-list source once, in order, then merge and
    /// persist. Per-source failures are downgraded to statuses; only missing
    /// or unreadable inputs abort the run.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let phase = phase_token(started_at);
        let period = period_token(started_at);
        info!(%run_id, phase, "starting listing harvest run");

        let mut entries = blh_storage::load_control_list(&self.config.control_list_path)
            .context("loading control list")?;
        let mut store = MergeStore::load(&self.config.master_path)?;

        let default_headers: BTreeMap<String, String> =
            [("User-Agent".to_string(), self.config.user_agent.clone())]
                .into_iter()
                .collect();

        let mut outcomes: Vec<SourceOutcome> = Vec::with_capacity(entries.len());
        let mut harvested: Vec<ListingRecord> = Vec::new();

        for entry in &entries {
            if !entry.opted_in {
                outcomes.push(SourceOutcome {
                    source_name: entry.site_name.clone(),
                    status: RunStatus::Skipped,
                    count: 0,
                });
                continue;
            }

            info!(source = %entry.site_name, url = %entry.listing_url, "scraping source");
            let config = build_scrape_config(entry, &store, &phase, &default_headers);

            let adapter = match self.registry.resolve(&entry.site_name) {
                Ok(adapter) => adapter,
                Err(err) => {
                    error!(source = %entry.site_name, %err, "adapter resolution failed");
                    outcomes.push(SourceOutcome {
                        source_name: entry.site_name.clone(),
                        status: RunStatus::AdapterNotFound,
                        count: 0,
                    });
                    continue;
                }
            };

            match self.invoke_adapter(adapter, config).await {
                Err(message) => {
                    error!(source = %entry.site_name, error = %message, "adapter raised during invocation");
                    outcomes.push(SourceOutcome {
                        source_name: entry.site_name.clone(),
                        status: RunStatus::Exception,
                        count: 0,
                    });
                }
                Ok(result) if result.is_empty() => {
                    warn!(source = %entry.site_name, "no new listings or empty result");
                    outcomes.push(SourceOutcome {
                        source_name: entry.site_name.clone(),
                        status: RunStatus::NoNewListings,
                        count: 0,
                    });
                }
                Ok(result) => {
                    let records = normalize_rows(&result);
                    let count = records.len() as u64;
                    debug!(source = %entry.site_name, count, "scraped listings");
                    harvested.extend(records);
                    outcomes.push(SourceOutcome {
                        source_name: entry.site_name.clone(),
                        status: RunStatus::Success,
                        count,
                    });
                }
            }
        }

        let mut persistence_errors = Vec::new();
        let new_listings = harvested.len();

        let snapshot = store.merge(harvested);
        let snapshot_path = match &snapshot {
            Some(records) => {
                match blh_storage::write_snapshot(&self.config.snapshot_dir, &period, records) {
                    Ok(path) => {
                        info!(count = records.len(), path = %path.display(), "wrote run snapshot");
                        Some(path)
                    }
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "failed to write run snapshot");
                        persistence_errors.push(format!("snapshot: {err:#}"));
                        None
                    }
                }
            }
            None => None,
        };

        if snapshot.is_some() {
            match blh_storage::save_master(&self.config.master_path, store.records()) {
                Ok(()) => info!(rows = store.len(), "updated master dataset"),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed to write master dataset");
                    persistence_errors.push(format!("master dataset: {err:#}"));
                }
            }
        }

        apply_outcomes(&mut entries, &outcomes);
        match blh_storage::save_control_list(&self.config.control_list_path, &entries) {
            Ok(()) => info!("updated control list statuses and counts"),
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to write control list");
                persistence_errors.push(format!("control list: {err:#}"));
            }
        }

        let finished_at = Utc::now();
        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            phase,
            period,
            sources_total: entries.len(),
            new_listings,
            master_rows: store.len(),
            snapshot_path,
            outcomes,
            persistence_errors,
        })
    }

    /// The per-source failure boundary. The adapter runs on its own task so
    /// a panic surfaces here as a join error instead of unwinding the run.
    async fn invoke_adapter(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        config: ScrapeConfig,
    ) -> std::result::Result<TabularResult, String> {
        let http = Arc::clone(&self.http);
        let handle = tokio::spawn(async move { adapter.scrape(&http, &config).await });
        match handle.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(err.to_string()),
            Err(join_err) if join_err.is_panic() => Err("adapter panicked".to_string()),
            Err(join_err) => Err(join_err.to_string()),
        }
    }
}

pub async fn run_once_from_env(registry: AdapterRegistry) -> Result<RunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env(), registry)?;
    pipeline.run_once().await
}

/// Periodic harvest driver; returns `None` unless enabled via configuration.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_id, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    new_listings = summary.new_listings,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    scheduler.add(job).await.context("adding scheduler job")?;
    Ok(Some(scheduler))
}

/// Markdown digest of the most recent run snapshots.
pub fn report_markdown(runs: usize, snapshot_dir: &Path) -> Result<String> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(snapshot_dir)
        .with_context(|| format!("reading {}", snapshot_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with("_listings.csv"))
        })
        .collect();
    paths.sort();
    paths.reverse();
    paths.truncate(runs.max(1));

    let mut lines = vec!["# Listing Harvest Report".to_string(), String::new()];
    for path in paths {
        let records = blh_storage::load_records(&path)?;
        let period = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.trim_end_matches("_listings").to_string())
            .unwrap_or_default();

        let mut broker_counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            *broker_counts.entry(record.broker_name.clone()).or_default() += 1;
        }

        lines.push(format!("## Period `{period}`"));
        lines.push(format!("- new listings: {}", records.len()));
        lines.push(format!("- snapshot: `{}`", path.display()));
        for (broker, count) in &broker_counts {
            lines.push(format!("  - {broker}: {count}"));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
