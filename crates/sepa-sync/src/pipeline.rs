//! Run orchestration: lock, fetch, extract + normalize + reconcile, load, cleanup.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use sepa_adapters::{
    extract_fetched, ExtractError, ExtractOptions, ExtractStats, FileOutcome, FileRole,
    MappingTable, NormalizeError, NormalizeStats, Normalizer, RawFile,
};
use sepa_core::SourceDescriptor;
use sepa_storage::{FetchedArchive, HttpFetcher, RunWorkspace};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError, LockLease, INGEST_LOCK};
use crate::config::{ConfigurationError, SyncConfig};
use crate::loader::{LoadReport, Loader};
use crate::reconcile::{BatchCounts, CanonicalBatch, ReconcileError, Reconciler};
use crate::resolver::SourceTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Locked,
    Fetching,
    Processing,
    Loading,
    Cleanup,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Locked => "locked",
            RunState::Fetching => "fetching",
            RunState::Processing => "processing",
            RunState::Loading => "loading",
            RunState::Cleanup => "cleanup",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("another run holds the ingest lock")]
    AlreadyRunning,
    #[error("all {attempted} sources failed to fetch; first error: {first_error}")]
    AllSourcesFailed {
        attempted: usize,
        first_error: String,
    },
    #[error("run exceeded its {budget_secs}s budget while {stage_name}", stage_name = .stage.as_str())]
    BudgetExceeded { stage: RunState, budget_secs: u64 },
    #[error("load stopped at {table} batch {batch_index} after {attempts} attempts: {error}")]
    LoadFailed {
        table: &'static str,
        batch_index: usize,
        attempts: usize,
        error: String,
    },
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

/// Everything one run owns, threaded through the stages.
pub struct RunContext {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub deadline: Instant,
    pub budget: Duration,
    pub workspace: RunWorkspace,
    pub lease: LockLease,
}

impl RunContext {
    pub fn check_budget(&self, stage: RunState) -> Result<(), PipelineError> {
        if Instant::now() >= self.deadline {
            return Err(self.budget_exceeded(stage));
        }
        Ok(())
    }

    fn budget_exceeded(&self, stage: RunState) -> PipelineError {
        PipelineError::BudgetExceeded {
            stage,
            budget_secs: self.budget.as_secs(),
        }
    }
}

/// Structured account of one run, logged, printed and written to `reports/`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunState,
    pub dry_run: bool,
    pub states: Vec<RunState>,
    pub sources_resolved: usize,
    pub archives_fetched: usize,
    pub fetch_failures: usize,
    pub bytes_fetched: u64,
    pub archives_unreadable: usize,
    pub extract: ExtractStats,
    pub files_normalized: usize,
    pub files_ignored: usize,
    pub files_failed: usize,
    pub normalize: NormalizeStats,
    pub rows_merged: usize,
    pub canonical: BatchCounts,
    pub load: Option<LoadReport>,
    pub failed_stage: Option<RunState>,
    pub first_error: Option<String>,
    pub cleanup_errors: Vec<String>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    fn new(run_id: Uuid, run_date: NaiveDate, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            run_date,
            started_at,
            finished_at: started_at,
            status: RunState::Idle,
            dry_run,
            states: vec![RunState::Idle],
            sources_resolved: 0,
            archives_fetched: 0,
            fetch_failures: 0,
            bytes_fetched: 0,
            archives_unreadable: 0,
            extract: ExtractStats::default(),
            files_normalized: 0,
            files_ignored: 0,
            files_failed: 0,
            normalize: NormalizeStats::default(),
            rows_merged: 0,
            canonical: BatchCounts::default(),
            load: None,
            failed_stage: None,
            first_error: None,
            cleanup_errors: Vec::new(),
            reports_dir: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunState::Done
    }

    fn enter(&mut self, state: RunState) {
        self.status = state;
        self.states.push(state);
        info!(state = state.as_str(), "run state");
    }

    fn fail(&mut self, err: &PipelineError) {
        self.failed_stage = Some(self.status);
        self.first_error = Some(err.to_string());
        warn!(stage = self.status.as_str(), error = %err, "run failed");
    }
}

enum Processed {
    File {
        label: String,
        outcome: Result<(FileOutcome, Reconciler), NormalizeError>,
    },
    Corrupt(ExtractError),
}

/// Raised when the merge stops, so detached normalizers quit early.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    sources: SourceTable,
    catalog: Arc<dyn Catalog>,
    fetcher: HttpFetcher,
    normalizer: Arc<Normalizer>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        sources: SourceTable,
        catalog: Arc<dyn Catalog>,
    ) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let normalizer = Arc::new(Normalizer::new(
            MappingTable::builtin(),
            config.allowed_chains.clone(),
        ));
        Ok(Self {
            config,
            sources,
            catalog,
            fetcher,
            normalizer,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run every stage for `run_date`. Failures are reported in the summary;
    /// cleanup has already happened when this returns.
    pub async fn run_once(&self, run_date: NaiveDate) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, %run_date, dry_run = self.config.dry_run);

        async move {
            let mut summary = RunSummary::new(run_id, run_date, started_at, self.config.dry_run);
            let deadline = Instant::now() + self.config.run_budget;

            match self.open_run(run_id, run_date, started_at, deadline, &mut summary).await {
                Ok((mut ctx, sources)) => {
                    let result = self.run_stages(&mut ctx, &sources, &mut summary).await;
                    if let Err(err) = &result {
                        summary.fail(err);
                    }
                    summary.enter(RunState::Cleanup);
                    self.cleanup(ctx, &mut summary).await;
                    summary.enter(if result.is_ok() {
                        RunState::Done
                    } else {
                        RunState::Failed
                    });
                }
                Err(err) => {
                    summary.fail(&err);
                    summary.enter(RunState::Failed);
                }
            }

            summary.finished_at = Utc::now();
            match self.write_reports(&summary).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %format!("{err:#}"), "could not write run reports"),
            }
            info!(
                status = summary.status.as_str(),
                fetched = summary.archives_fetched,
                files = summary.files_normalized,
                accepted = summary.normalize.accepted,
                rejected = summary.normalize.rejected_total(),
                stores = summary.canonical.stores,
                products = summary.canonical.products,
                prices = summary.canonical.prices,
                "run finished"
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Idle → Locked: resolve sources, take the lock, create the workspace.
    async fn open_run(
        &self,
        run_id: Uuid,
        run_date: NaiveDate,
        started_at: DateTime<Utc>,
        deadline: Instant,
        summary: &mut RunSummary,
    ) -> Result<(RunContext, Vec<SourceDescriptor>), PipelineError> {
        let sources = self.sources.resolve(run_date)?;
        summary.sources_resolved = sources.len();

        let lease = self
            .catalog
            .try_acquire_lock(INGEST_LOCK, run_id, self.config.lock_ttl())
            .await?
            .ok_or(PipelineError::AlreadyRunning)?;

        let workspace = match RunWorkspace::create(&self.config.work_dir, run_id) {
            Ok(workspace) => workspace,
            Err(err) => {
                if let Err(release) = self.catalog.release_lock(&lease).await {
                    warn!(error = %release, "could not release ingest lock");
                }
                return Err(err.into());
            }
        };
        summary.enter(RunState::Locked);

        Ok((
            RunContext {
                run_id,
                run_date,
                started_at,
                deadline,
                budget: self.config.run_budget,
                workspace,
                lease,
            },
            sources,
        ))
    }

    async fn run_stages(
        &self,
        ctx: &mut RunContext,
        sources: &[SourceDescriptor],
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        summary.enter(RunState::Fetching);
        self.heartbeat(ctx).await?;
        let archives = self.fetch_all(ctx, sources, summary).await?;

        summary.enter(RunState::Processing);
        self.heartbeat(ctx).await?;
        let mut reconciler = Reconciler::new(ctx.started_at);
        for archive in &archives {
            ctx.check_budget(RunState::Processing)?;
            self.process_archive(ctx, archive, &mut reconciler, summary)
                .await?;
        }
        summary.rows_merged = reconciler.rows_merged();
        let batch = reconciler.finish();
        batch.check_consistency()?;
        summary.canonical = batch.counts();

        summary.enter(RunState::Loading);
        ctx.check_budget(RunState::Loading)?;
        self.heartbeat(ctx).await?;
        self.load(ctx, &batch, summary).await
    }

    async fn heartbeat(&self, ctx: &mut RunContext) -> Result<(), PipelineError> {
        ctx.lease = self
            .catalog
            .renew_lock(&ctx.lease, self.config.lock_ttl())
            .await?;
        Ok(())
    }

    async fn fetch_all(
        &self,
        ctx: &RunContext,
        sources: &[SourceDescriptor],
        summary: &mut RunSummary,
    ) -> Result<Vec<FetchedArchive>, PipelineError> {
        let mut archives = Vec::with_capacity(sources.len());
        let mut first_error = None;

        for (index, source) in sources.iter().enumerate() {
            ctx.check_budget(RunState::Fetching)?;
            let dest = ctx.workspace.archive_path(index, source);
            let fetched = tokio::time::timeout_at(
                ctx.deadline,
                self.fetcher.fetch_archive(ctx.run_id, source, &dest),
            )
            .await
            .map_err(|_| ctx.budget_exceeded(RunState::Fetching))?;

            match fetched {
                Ok(archive) => {
                    summary.archives_fetched += 1;
                    summary.bytes_fetched += archive.byte_size;
                    archives.push(archive);
                }
                Err(err) => {
                    summary.fetch_failures += 1;
                    warn!(source = source.display_name(), error = %err, "skipping source");
                    first_error.get_or_insert_with(|| err.to_string());
                }
            }
        }

        if archives.is_empty() {
            return Err(PipelineError::AllSourcesFailed {
                attempted: sources.len(),
                first_error: first_error.unwrap_or_else(|| "no sources".to_string()),
            });
        }
        Ok(archives)
    }

    /// Extract on a blocking thread, normalize files concurrently, merge in
    /// archive order on this task.
    async fn process_archive(
        &self,
        ctx: &RunContext,
        archive: &FetchedArchive,
        reconciler: &mut Reconciler,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let workers = self.config.normalize_workers.max(1);
        let (tx, rx) = mpsc::channel::<Result<RawFile, ExtractError>>(workers * 2);

        let fetched = archive.clone();
        let out_dir = ctx.workspace.extract_dir();
        let options = ExtractOptions {
            allowed_chains: self.config.allowed_chains.clone(),
        };
        let extractor = tokio::task::spawn_blocking(move || {
            let mut entries = extract_fetched(&fetched, &out_dir, options)?;
            for item in entries.by_ref() {
                if tx.blocking_send(item).is_err() {
                    break;
                }
            }
            Ok::<_, ExtractError>(entries.stats().clone())
        });

        let merged = self.merge_stream(ctx, rx, reconciler, summary).await;

        let extracted = extractor
            .await
            .context("extractor thread panicked")?;
        match extracted {
            Ok(stats) => summary.extract.merge(&stats),
            Err(err) => {
                summary.archives_unreadable += 1;
                warn!(archive = archive.source.display_name(), error = %err, "skipping unreadable archive");
            }
        }
        merged
    }

    async fn merge_stream(
        &self,
        ctx: &RunContext,
        rx: mpsc::Receiver<Result<RawFile, ExtractError>>,
        reconciler: &mut Reconciler,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let normalizer = self.normalizer.clone();
        let observed_at = ctx.started_at;
        let cancel = Arc::new(AtomicBool::new(false));
        let _stop = CancelOnDrop(cancel.clone());
        let processed = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .map(move |item| {
            let normalizer = normalizer.clone();
            let cancel = cancel.clone();
            async move {
                match item {
                    Ok(file) => normalize_blocking(normalizer, file, observed_at, cancel).await,
                    Err(err) => Ok(Processed::Corrupt(err)),
                }
            }
        })
        .buffered(self.config.normalize_workers.max(1));
        futures::pin_mut!(processed);

        loop {
            let next = tokio::time::timeout_at(ctx.deadline, processed.next())
                .await
                .map_err(|_| ctx.budget_exceeded(RunState::Processing))?;
            let Some(item) = next else {
                return Ok(());
            };
            match item? {
                Processed::File { label, outcome } => match outcome {
                    Ok((outcome, partial)) => {
                        if outcome.role == FileRole::Ignored {
                            summary.files_ignored += 1;
                            continue;
                        }
                        summary.files_normalized += 1;
                        summary.normalize.merge(&outcome.stats);
                        reconciler.absorb(partial);
                    }
                    Err(err) => {
                        summary.files_failed += 1;
                        warn!(file = %label, error = %err, "skipping file");
                    }
                },
                Processed::Corrupt(err) => {
                    warn!(error = %err, "corrupt archive entry");
                }
            }
            ctx.check_budget(RunState::Processing)?;
        }
    }

    async fn load(
        &self,
        ctx: &RunContext,
        batch: &CanonicalBatch,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let loader = Loader::new(
            self.catalog.clone(),
            self.config.load_batch_size,
            self.config.backoff(),
        );
        let mut report = tokio::time::timeout_at(ctx.deadline, loader.load(batch))
            .await
            .map_err(|_| ctx.budget_exceeded(RunState::Loading))?;
        report.rejected = summary.normalize.rejected_total();
        let failed = report.failed.clone();
        summary.load = Some(report);

        match failed {
            Some(failed) => Err(PipelineError::LoadFailed {
                table: failed.table.as_str(),
                batch_index: failed.batch_index,
                attempts: failed.attempts,
                error: failed.error,
            }),
            None => Ok(()),
        }
    }

    /// Unconditional: remove the workspace, release the lock.
    async fn cleanup(&self, ctx: RunContext, summary: &mut RunSummary) {
        let RunContext {
            workspace, lease, ..
        } = ctx;
        let workspace_path = workspace.path().display().to_string();
        if let Err(err) = workspace.close() {
            warn!(path = %workspace_path, error = %err, "could not remove run workspace");
            summary
                .cleanup_errors
                .push(format!("removing {workspace_path}: {err}"));
        }
        if let Err(err) = self.catalog.release_lock(&lease).await {
            warn!(error = %err, "could not release ingest lock");
            summary.cleanup_errors.push(format!("releasing lock: {err}"));
        }
    }

    async fn write_reports(&self, summary: &RunSummary) -> anyhow::Result<PathBuf> {
        let reports_dir = self
            .config
            .reports_dir
            .join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), json)
            .await
            .context("writing run_summary.json")?;
        fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary))
            .await
            .context("writing daily_brief.md")?;
        Ok(reports_dir)
    }
}

/// Normalize one file into its own partial batch. What stays in memory
/// follows the file's distinct keys, not its row count.
fn fold_file(
    normalizer: &Normalizer,
    file: &RawFile,
    observed_at: DateTime<Utc>,
    cancel: &AtomicBool,
) -> Result<(FileOutcome, Reconciler), NormalizeError> {
    let mut partial = Reconciler::new(observed_at);
    let outcome = normalizer.normalize_file(file, |row| {
        if cancel.load(Ordering::Relaxed) {
            return ControlFlow::Break(());
        }
        partial.push(row);
        ControlFlow::Continue(())
    })?;
    Ok((outcome, partial))
}

async fn normalize_blocking(
    normalizer: Arc<Normalizer>,
    file: RawFile,
    observed_at: DateTime<Utc>,
    cancel: Arc<AtomicBool>,
) -> Result<Processed, PipelineError> {
    let label = file.label();
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = fold_file(&normalizer, &file, observed_at, &cancel);
        if let Err(err) = file.discard() {
            warn!(path = %file.path.display(), error = %err, "could not remove raw file");
        }
        outcome
    })
    .await
    .context("normalizer thread panicked")?;
    Ok(Processed::File { label, outcome })
}

pub fn daily_brief(summary: &RunSummary) -> String {
    let rejected = if summary.normalize.rejected.is_empty() {
        "- none".to_string()
    } else {
        summary
            .normalize
            .rejected
            .iter()
            .map(|(reason, count)| {
                let reason = serde_json::to_value(reason)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| format!("{reason:?}"));
                format!("- {reason}: {count}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let load = match &summary.load {
        Some(load) => format!(
            "- Stores: {} inserted, {} updated\n- Products: {} inserted, {} updated\n- Prices: {} inserted, {} updated\n- Batches committed: {} ({} retries)",
            load.stores.inserted,
            load.stores.updated,
            load.products.inserted,
            load.products.updated,
            load.prices.inserted,
            load.prices.updated,
            load.batches_committed,
            load.retries,
        ),
        None => "- not reached".to_string(),
    };

    format!(
        "# SEPA Daily Brief\n\n- Run ID: `{}`\n- Run date: {}\n- Started: {}\n- Finished: {}\n- Status: {}{}\n\n## Fetch\n- Sources: {}\n- Archives fetched: {} ({} bytes)\n- Fetch failures: {}\n\n## Processing\n- Files normalized: {} (ignored {}, failed {})\n- Corrupt entries: {}\n- Rows read: {}\n- Rows accepted: {}\n- Rows filtered: {}\n- Canonical: {} stores, {} products, {} prices\n\n## Rejected Rows\n{}\n\n## Load\n{}\n",
        summary.run_id,
        summary.run_date,
        summary.started_at,
        summary.finished_at,
        summary.status.as_str(),
        summary
            .first_error
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default(),
        summary.sources_resolved,
        summary.archives_fetched,
        summary.bytes_fetched,
        summary.fetch_failures,
        summary.files_normalized,
        summary.files_ignored,
        summary.files_failed,
        summary.extract.corrupt_entries,
        summary.normalize.rows_read,
        summary.normalize.accepted,
        summary.normalize.filtered,
        summary.canonical.stores,
        summary.canonical.products,
        summary.canonical.prices,
        rejected,
        load,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sepa_adapters::RejectReason;

    #[test]
    fn brief_lists_rejections_and_status() {
        let started = Utc.with_ymd_and_hms(2024, 10, 14, 12, 0, 0).unwrap();
        let mut summary = RunSummary::new(
            Uuid::nil(),
            NaiveDate::from_ymd_opt(2024, 10, 14).unwrap(),
            started,
            false,
        );
        summary.normalize.rejected.insert(RejectReason::InvalidPrice, 3);
        summary.status = RunState::Failed;
        summary.first_error = Some("another run holds the ingest lock".into());

        let brief = daily_brief(&summary);

        assert!(brief.contains("- Status: failed (another run holds the ingest lock)"));
        assert!(brief.contains("- invalid_price: 3"));
        assert!(brief.contains("- not reached"));
    }

    fn raw_file(dir: &tempfile::TempDir, body: &str) -> RawFile {
        let path = dir.path().join("prices.csv");
        std::fs::write(&path, body).unwrap();
        RawFile {
            path,
            entry_name: "prices.csv".into(),
            container: None,
            retailer_group: sepa_core::RetailerGroup::generic(),
            chain_hint: None,
            byte_size: body.len() as u64,
        }
    }

    #[test]
    fn file_fold_retains_distinct_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("store_id,barcode,price\n");
        for i in 0..5000 {
            body.push_str(&format!("9,7795735000328,{}\n", 1000 + i));
        }
        let file = raw_file(&dir, &body);

        let (outcome, partial) =
            fold_file(&Normalizer::default(), &file, Utc::now(), &AtomicBool::new(false)).unwrap();

        assert_eq!(outcome.stats.accepted, 5000);
        assert_eq!(partial.rows_merged(), 5000);
        assert_eq!(
            partial.counts(),
            BatchCounts { stores: 1, products: 1, prices: 1 }
        );
        let batch = partial.finish();
        let last = &batch.prices[&("9".to_string(), "7795735000328".to_string())];
        assert_eq!(last.price.cents(), 599_900);
    }

    #[test]
    fn cancelled_fold_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let file = raw_file(&dir, "store_id,barcode,price\n1,12345678,1\n2,12345678,2\n");

        let (outcome, partial) =
            fold_file(&Normalizer::default(), &file, Utc::now(), &AtomicBool::new(true)).unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.stats.rows_read, 1);
        assert_eq!(partial.rows_merged(), 0);
    }

    #[test]
    fn dropping_the_merge_guard_cancels() {
        let flag = Arc::new(AtomicBool::new(false));
        drop(CancelOnDrop(flag.clone()));
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn budget_error_names_the_stage() {
        let err = PipelineError::BudgetExceeded {
            stage: RunState::Loading,
            budget_secs: 3300,
        };
        assert_eq!(err.to_string(), "run exceeded its 3300s budget while loading");
    }
}
