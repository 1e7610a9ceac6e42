use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pipeline::SyncPipeline;

/// In-process trigger for deployments without an external scheduler.
///
/// Overlapping firings are safe: the second one fails to take the ingest lock.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().scheduler_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let run_date = match pipeline.config().run_date_at(Utc::now()) {
                Ok(date) => date,
                Err(err) => {
                    warn!(error = %err, "scheduled run skipped");
                    return;
                }
            };
            let summary = pipeline.run_once(run_date).await;
            if summary.succeeded() {
                info!(run_id = %summary.run_id, "scheduled run done");
            } else {
                warn!(
                    run_id = %summary.run_id,
                    error = summary.first_error.as_deref().unwrap_or("unknown"),
                    "scheduled run failed"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, "scheduler configured");
    Ok(sched)
}
