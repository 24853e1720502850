//! Monthly run orchestration: reconcile, extract, consolidate, report.

pub mod competency;
pub mod extract;
pub mod merge;
pub mod reconcile;
pub mod report;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use crep_adapters::{Pacing, TopicCatalog, TopicConfig, CATALOG_FILE};
use crep_core::MonthKey;
use crep_storage::{
    file_digest, write_atomic, BackoffPolicy, BackoffRequester, ReqwestTransport, Sleeper,
    SnapshotStore, TokioSleeper, Transport,
};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub use competency::{fetch_competencies, load_roster, CompetencyFetch};
pub use extract::{OutcomeSink, TopicExtractor, WorkItem};
pub use merge::{ConsolidationMerger, MergeOutcome, SkipReason};
pub use reconcile::{
    plan_work, CopyReason, ReconcileError, ReconcileVerdict, ReconciliationEngine, SnapshotTriple,
    WorkPlan,
};
pub use report::{ExecutionTracker, TrackerSummary};

pub const CRATE_NAME: &str = "crep-sync";

pub const MANIFEST_FILE: &str = "run_manifest.json";

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_root: PathBuf,
    pub workspace_root: PathBuf,
    pub roster_path: PathBuf,
    pub target_month: MonthKey,
    pub competency_url: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub pacing: Pacing,
    pub closed_only: bool,
    pub min_competency_year: i32,
    pub drive_folder_id: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("CREP_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let roster_path = std::env::var("CREP_ROSTER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("unidades_tokens.csv"));
        let default_month = MonthKey::preceding(Local::now().date_naive());
        let target_month = match env_opt("CREP_TARGET_MONTH") {
            Some(raw) => raw.parse::<MonthKey>().unwrap_or_else(|err| {
                warn!(value = %raw, error = %err, "ignoring invalid CREP_TARGET_MONTH");
                default_month
            }),
            None => default_month,
        };

        let defaults = Pacing::default();
        let pacing = Pacing {
            delay_between_calls: Duration::from_millis(env_parse(
                "CREP_DELAY_BETWEEN_CALLS_MS",
                defaults.delay_between_calls.as_millis() as u64,
            )),
            delay_between_units: Duration::from_millis(env_parse(
                "CREP_DELAY_BETWEEN_UNITS_MS",
                defaults.delay_between_units.as_millis() as u64,
            )),
            group_by_unit: defaults.group_by_unit,
            backoff: BackoffPolicy {
                max_attempts: env_parse("CREP_MAX_ATTEMPTS", defaults.backoff.max_attempts),
                initial_backoff: Duration::from_millis(env_parse(
                    "CREP_INITIAL_BACKOFF_MS",
                    defaults.backoff.initial_backoff.as_millis() as u64,
                )),
                ..defaults.backoff
            },
        };

        Self {
            data_root: std::env::var("CREP_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            roster_path,
            workspace_root,
            target_month,
            competency_url: env_opt("CREP_COMPETENCY_URL"),
            http_timeout_secs: env_parse("CREP_HTTP_TIMEOUT_SECS", 60),
            user_agent: std::env::var("CREP_USER_AGENT")
                .unwrap_or_else(|_| "crep/0.1".to_string()),
            pacing,
            closed_only: env_flag("CREP_CLOSED_ONLY", true),
            min_competency_year: env_parse("CREP_MIN_COMPETENCY_YEAR", 2024),
            drive_folder_id: env_opt("CREP_DRIVE_FOLDER_ID"),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.workspace_root.join(CATALOG_FILE)
    }
}

/// Receives the finished topic files of a run.
pub trait UploadSink: Send + Sync {
    fn upload(&self, files: &[String], folder_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct LoggingUploadSink;

impl UploadSink for LoggingUploadSink {
    fn upload(&self, files: &[String], folder_id: &str) -> Result<()> {
        info!(folder_id, files = files.len(), names = ?files, "upload handoff");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub month: String,
    pub mode: String,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<RunManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicRunSummary {
    pub topic: String,
    pub extracted: Option<String>,
    pub merge: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub month: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub work_items: usize,
    pub topics: Vec<TopicRunSummary>,
    pub files: Vec<String>,
    pub outcomes: TrackerSummary,
    /// Absent when the manifest could not be written.
    pub manifest: Option<String>,
}

fn describe_merge(outcome: &MergeOutcome) -> String {
    match outcome {
        MergeOutcome::Merged {
            new_rows,
            old_rows,
            merged_rows,
            ..
        } => format!("merged {new_rows}+{old_rows}->{merged_rows}"),
        MergeOutcome::Skipped(SkipReason::NoCurrentDataset) => "skipped: no dataset".to_string(),
        MergeOutcome::Skipped(SkipReason::NoPreviousDataset) => "skipped: first month".to_string(),
        MergeOutcome::Skipped(SkipReason::CarriedForward(_)) => "carried forward".to_string(),
        MergeOutcome::Failed(err) => format!("failed: {err}"),
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    catalog: TopicCatalog,
    store: SnapshotStore,
    requester: BackoffRequester,
    upload: Box<dyn UploadSink>,
    base_urls: BTreeMap<String, String>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(Some(config.user_agent.as_str()))?;
        Self::with_transport(config, Arc::new(transport), Arc::new(TokioSleeper))
    }

    pub fn with_transport(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let catalog_path = config.catalog_path();
        let catalog = TopicCatalog::load(&catalog_path)
            .with_context(|| format!("loading {}", catalog_path.display()))?;
        Ok(Self {
            store: SnapshotStore::new(config.data_root.clone()),
            requester: BackoffRequester::new(transport, sleeper),
            upload: Box::<LoggingUploadSink>::default(),
            base_urls: BTreeMap::new(),
            catalog,
            config,
        })
    }

    pub fn with_requester(mut self, requester: BackoffRequester) -> Self {
        self.requester = requester;
        self
    }

    pub fn with_upload_sink(mut self, upload: Box<dyn UploadSink>) -> Self {
        self.upload = upload;
        self
    }

    /// Pins a topic's base URL instead of reading its environment variable.
    pub fn with_base_url(mut self, topic_id: &str, base_url: &str) -> Self {
        self.base_urls
            .insert(topic_id.to_lowercase(), base_url.to_string());
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn catalog(&self) -> &TopicCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn base_url(&self, topic: &TopicConfig) -> Option<String> {
        self.base_urls
            .get(&topic.id.to_lowercase())
            .cloned()
            .or_else(|| topic.base_url_from_env())
    }

    /// Refreshes the target month's competency snapshot from the roster.
    pub async fn fetch_competencies(&self) -> Result<Option<PathBuf>> {
        let Some(base_url) = &self.config.competency_url else {
            anyhow::bail!("CREP_COMPETENCY_URL is not set");
        };
        let roster = load_roster(&self.config.roster_path)
            .with_context(|| format!("loading roster {}", self.config.roster_path.display()))?;
        let fetch = CompetencyFetch {
            base_url: base_url.clone(),
            timeout: Duration::from_secs(self.config.http_timeout_secs),
            min_year: self.config.min_competency_year,
            delay_between_calls: self.config.pacing.delay_between_calls,
            backoff: self.config.pacing.backoff,
        };
        fetch_competencies(
            &self.requester,
            &self.store,
            self.config.target_month,
            &roster,
            &fetch,
        )
        .await
    }

    pub fn reconcile(&self) -> Result<ReconcileVerdict> {
        let engine = ReconciliationEngine::new(self.store.clone());
        Ok(engine.reconcile(self.config.target_month, self.config.closed_only)?)
    }

    /// Consolidates every enabled topic for the target month.
    pub fn merge_all(&self) -> Vec<(String, MergeOutcome)> {
        let merger = ConsolidationMerger::new(self.store.clone());
        self.catalog
            .enabled()
            .map(|topic| (topic.id.clone(), merger.merge(topic, self.config.target_month)))
            .collect()
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let month = self.config.target_month;
        info!(%run_id, month = %month, "run started");

        if self.config.competency_url.is_some() {
            match self.fetch_competencies().await {
                Ok(Some(_)) => {}
                Ok(None) => warn!(month = %month, "competency refresh produced nothing; using existing snapshot"),
                Err(err) => error!(month = %month, error = %format!("{err:#}"), "competency refresh failed; using existing snapshot"),
            }
        }

        let verdict = match self.reconcile() {
            Ok(verdict) => verdict,
            Err(err) => {
                error!(month = %month, error = %format!("{err:#}"), "reconciliation failed; falling back to copy");
                ReconcileVerdict::Copy(CopyReason::CurrentSnapshotUnavailable(format!("{err:#}")))
            }
        };
        let mut tracker = ExecutionTracker::new();
        let mut topics = Vec::new();
        let mut files: Vec<PathBuf> = Vec::new();
        let mut work_items = 0usize;

        match &verdict {
            ReconcileVerdict::Copy(reason) => {
                info!(month = %month, ?reason, "copy mode");
                let merger = ConsolidationMerger::new(self.store.clone());
                files = merger.copy_previous(self.catalog.enabled(), month);
            }
            ReconcileVerdict::Process { work_list, entries } => {
                work_items = *entries;
                let extractor = TopicExtractor::new(
                    self.requester.clone(),
                    self.store.clone(),
                    month,
                    self.config.pacing,
                );
                let merger = ConsolidationMerger::new(self.store.clone());
                for topic in self.catalog.enabled() {
                    let extracted = match self.base_url(topic) {
                        Some(base_url) => {
                            extractor
                                .extract(work_list, topic, &base_url, &mut tracker)
                                .await
                        }
                        None => {
                            warn!(topic = %topic.id, env = %topic.url_env, "endpoint not configured; topic skipped");
                            None
                        }
                    };
                    let merged = merger.merge(topic, month);
                    if let Some(path) = merged.final_path() {
                        files.push(path.to_path_buf());
                    } else if let Some(path) = &extracted {
                        files.push(path.clone());
                    }
                    topics.push(TopicRunSummary {
                        topic: topic.id.clone(),
                        extracted: extracted.map(|p| p.display().to_string()),
                        merge: describe_merge(&merged),
                    });
                }
            }
        }

        let manifest_path = match self.store.ensure_month_dir(month) {
            Ok(month_dir) => {
                if let Err(err) = tracker.write_reports(&month_dir) {
                    error!(error = %format!("{err:#}"), "writing execution report failed");
                }
                match self.write_manifest(&month_dir, run_id, &verdict, &files) {
                    Ok(path) => Some(path),
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "writing run manifest failed");
                        None
                    }
                }
            }
            Err(err) => {
                error!(month = %month, error = %format!("{err:#}"), "month directory unavailable; reports and manifest skipped");
                None
            }
        };
        let names: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        if let Some(folder_id) = &self.config.drive_folder_id {
            if let Err(err) = self.upload.upload(&names, folder_id) {
                error!(error = %format!("{err:#}"), "upload handoff failed");
            }
        }

        let finished_at = Utc::now();
        info!(%run_id, mode = verdict.mode_label(), files = names.len(), "run finished");
        Ok(SyncRunSummary {
            run_id,
            month: month.to_string(),
            mode: verdict.mode_label().to_string(),
            started_at,
            finished_at,
            work_items,
            topics,
            files: names,
            outcomes: tracker.summary(),
            manifest: manifest_path.map(|p| p.display().to_string()),
        })
    }

    fn write_manifest(
        &self,
        month_dir: &Path,
        run_id: Uuid,
        verdict: &ReconcileVerdict,
        files: &[PathBuf],
    ) -> Result<PathBuf> {
        let manifest = RunManifest {
            schema_version: 1,
            run_id,
            month: self.config.target_month.to_string(),
            mode: verdict.mode_label().to_string(),
            generated_at: Utc::now(),
            files: files
                .iter()
                .map(|path| manifest_entry(month_dir, path))
                .collect::<Result<Vec<_>>>()?,
        };
        let path = month_dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
        write_atomic(&path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

fn manifest_entry(month_dir: &Path, path: &Path) -> Result<RunManifestFile> {
    let (sha256, bytes) = file_digest(path)?;
    Ok(RunManifestFile {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        path: path
            .strip_prefix(month_dir)
            .unwrap_or(path)
            .display()
            .to_string(),
        sha256,
        bytes,
    })
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}
