use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::debug;

use crate::pass::IngestionCoordinator;

/// Builds (but does not start) a scheduler that triggers a pass every
/// `every`. Ticks that land while a pass is running are skipped by the guard.
pub async fn build_scheduler(coordinator: Arc<IngestionCoordinator>, every: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(every, move |_uuid, _l| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            if coordinator.run_pass().await.is_skipped() {
                debug!("scheduled tick skipped");
            }
        })
    })
    .with_context(|| format!("creating ingestion job repeating every {every:?}"))?;
    sched.add(job).await.context("adding ingestion job")?;
    Ok(sched)
}
