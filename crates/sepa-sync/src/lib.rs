//! SEPA ingestion: source resolution, reconciliation, loading and run orchestration.

mod catalog;
mod config;
mod loader;
mod pipeline;
mod postgres;
mod reconcile;
mod resolver;
mod schedule;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

pub use catalog::{
    sort_offers, Catalog, CatalogError, CatalogReader, LockLease, MemoryCatalog, UpsertCounts,
    INGEST_LOCK,
};
pub use config::{parse_chain_list, ConfigurationError, SyncConfig};
pub use loader::{FailedBatch, LoadReport, Loader, Table};
pub use pipeline::{daily_brief, PipelineError, RunContext, RunState, RunSummary, SyncPipeline};
pub use postgres::{connect_pool, run_migrations, PgCatalog, MIGRATOR};
pub use reconcile::{BatchCounts, CanonicalBatch, ReconcileError, Reconciler};
pub use resolver::SourceTable;
pub use schedule::build_scheduler;

pub const CRATE_NAME: &str = "sepa-sync";

const PIPELINE_DB_CONNECTIONS: u32 = 4;

/// Wire a pipeline from configuration. Credentials are checked before any I/O;
/// dry runs load into an in-memory catalog.
pub async fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let database_url = if config.dry_run {
        None
    } else {
        Some(config.require_database_url()?.to_string())
    };
    let sources = SourceTable::load(&config.sources_path)?;

    let catalog: Arc<dyn Catalog> = match database_url {
        Some(url) => {
            let pool = connect_pool(&url, PIPELINE_DB_CONNECTIONS).await?;
            Arc::new(PgCatalog::new(pool))
        }
        None => Arc::new(MemoryCatalog::new()),
    };
    SyncPipeline::new(config, sources, catalog).context("building sync pipeline")
}

pub async fn run_sync_once_from_env(date: Option<NaiveDate>, dry_run: bool) -> Result<RunSummary> {
    let config = SyncConfig::from_env()?.with_dry_run(dry_run);
    let run_date = match date {
        Some(date) => date,
        None => config.run_date_at(Utc::now())?,
    };
    let pipeline = build_pipeline(config).await?;
    Ok(pipeline.run_once(run_date).await)
}
