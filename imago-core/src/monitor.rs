//! The job monitor: a periodic reconciliation loop that closes stages
//! whose counters have saturated and rolls completed stages up into
//! terminal job status. Jobs only ever reach `Completed` through this
//! loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use imago_model::{
    BackgroundJob, JobStatus, StageStatus, STAGE_CACHE, STAGE_SCAN, STAGE_THUMBNAIL,
};

use crate::error::Result;
use crate::store::{CollectionRepository, JobRepository};

#[derive(Clone)]
pub struct JobMonitor {
    jobs: Arc<dyn JobRepository>,
    collections: Arc<dyn CollectionRepository>,
    interval: Duration,
}

impl std::fmt::Debug for JobMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMonitor")
            .field("interval", &self.interval)
            .finish()
    }
}

impl JobMonitor {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        collections: Arc<dyn CollectionRepository>,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            collections,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.tick().await {
                    warn!(error = %e, "monitor tick failed");
                }
            }
            debug!("job monitor stopped");
        })
    }

    /// One reconciliation pass over every non-terminal job.
    pub async fn tick(&self) -> Result<()> {
        for job in self.jobs.list_active().await? {
            if let Err(e) = self.reconcile(&job).await {
                warn!(job = %job.id, error = %e, "job reconciliation failed");
            }
        }
        Ok(())
    }

    async fn reconcile(&self, job: &BackgroundJob) -> Result<()> {
        if job.any_stage_failed() {
            let reason = job
                .stages
                .values()
                .find_map(|stage| stage.error_message.clone());
            self.jobs
                .set_job_status(&job.id, JobStatus::Failed, reason)
                .await?;
            info!(job = %job.id, "job failed");
            return Ok(());
        }

        match job.collection_id {
            Some(collection_id) => {
                let Some(collection) = self.collections.get(&collection_id).await? else {
                    self.jobs
                        .set_job_status(
                            &job.id,
                            JobStatus::Failed,
                            Some(format!("collection {collection_id} no longer exists")),
                        )
                        .await?;
                    return Ok(());
                };
                // Observed progress from the aggregate itself; counters
                // lost to direct mode or dropped updates get corrected in
                // the same write that closes the stage.
                let observations = [
                    (STAGE_SCAN, collection.images.len() as u64),
                    (STAGE_THUMBNAIL, collection.thumbnails.len() as u64),
                    (STAGE_CACHE, collection.cache_images.len() as u64),
                ];
                for (name, observed) in observations {
                    let Some(stage) = job.stage(name) else {
                        continue;
                    };
                    if stage.status == StageStatus::Completed
                        || stage.status == StageStatus::Failed
                    {
                        continue;
                    }
                    if stage.total_items > 0 && observed >= stage.total_items {
                        self.jobs
                            .close_stage(&job.id, name, stage.total_items)
                            .await?;
                    } else if stage.is_saturated() {
                        self.jobs
                            .close_stage(&job.id, name, stage.total_items)
                            .await?;
                    }
                }
            }
            None => {
                // Library-wide jobs: each stage closes on its own counters.
                for (name, stage) in &job.stages {
                    if stage.status != StageStatus::Completed && stage.is_saturated() {
                        self.jobs
                            .close_stage(&job.id, name, stage.total_items)
                            .await?;
                    }
                }
            }
        }

        // Terminal closure happens here and only here.
        if let Some(job) = self.jobs.get(&job.id).await?
            && !job.status.is_terminal()
            && job.all_stages_completed()
        {
            self.jobs.complete_job(&job.id).await?;
            info!(job = %job.id, "job completed");
        }
        Ok(())
    }
}
