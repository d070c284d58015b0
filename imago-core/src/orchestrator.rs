//! Pipeline entry points used by the API layer: trigger a library scan,
//! rescan one collection, cancel a job.
//!
//! Jobs are created with their stages map seeded before the first message
//! is published — consumers can only increment stages that already exist,
//! so creation order is load-bearing.

use std::path::PathBuf;

use tracing::info;
use uuid::Uuid;

use imago_model::{
    BackgroundJob, Collection, CollectionId, CollectionScanMessage, JobId, JobKind,
    LibraryId, LibraryScanMessage, StageMessage, STAGE_CACHE, STAGE_SCAN, STAGE_THUMBNAIL,
};

use crate::broker::publish_message;
use crate::error::{ImagoError, Result};
use crate::pipeline::PipelineDeps;

#[derive(Clone, Debug)]
pub struct LibraryScanRequest {
    pub library_id: LibraryId,
    pub library_path: PathBuf,
    pub include_subfolders: bool,
    pub resume_incomplete: bool,
    pub overwrite_existing: bool,
    pub use_direct_file_access: bool,
    pub auto_scan: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RescanOptions {
    pub use_direct_file_access: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct ScanOrchestrator {
    deps: PipelineDeps,
}

impl ScanOrchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Creates the orchestrator job for a library walk and publishes the
    /// library-scan message. The job's `scan` stage counts candidate
    /// collections handled.
    pub async fn trigger_library_scan(&self, request: LibraryScanRequest) -> Result<JobId> {
        if request.library_path.as_os_str().is_empty() {
            return Err(ImagoError::Validation("library path must not be empty".into()));
        }

        let job = BackgroundJob::new(JobKind::LibraryScan, Uuid::new_v4())
            .for_library(request.library_id)
            .with_stage(STAGE_SCAN, 0);
        let job_id = job.id;
        self.deps.jobs.create(job).await?;

        let message = StageMessage::LibraryScan(LibraryScanMessage {
            library_id: request.library_id,
            library_path: request.library_path.clone(),
            include_subfolders: request.include_subfolders,
            force_rescan: request.overwrite_existing,
            resume_incomplete: request.resume_incomplete,
            overwrite_existing: request.overwrite_existing,
            use_direct_file_access: request.use_direct_file_access,
            auto_scan: request.auto_scan,
            job_id,
        });
        publish_message(&*self.deps.broker, &message).await?;

        info!(
            library = %request.library_id,
            path = %request.library_path.display(),
            job = %job_id,
            "library scan enqueued"
        );
        Ok(job_id)
    }

    /// Rescans one collection, clearing and rebuilding its image arrays.
    pub async fn trigger_collection_rescan(
        &self,
        collection_id: &CollectionId,
        options: RescanOptions,
    ) -> Result<JobId> {
        let collection = self
            .deps
            .collections
            .get(collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {collection_id}")))?;

        let collection = match options.use_direct_file_access {
            Some(direct) if direct != collection.settings.use_direct_file_access => {
                let mut settings = collection.settings;
                settings.use_direct_file_access = direct;
                self.deps
                    .collections
                    .update_settings(collection_id, settings)
                    .await?;
                self.deps
                    .collections
                    .get(collection_id)
                    .await?
                    .ok_or_else(|| ImagoError::NotFound(format!("collection {collection_id}")))?
            }
            _ => collection,
        };

        let job_id = self.enqueue_collection_scan(&collection, true).await?;
        info!(collection = %collection_id, job = %job_id, "collection rescan enqueued");
        Ok(job_id)
    }

    /// Flips a non-terminal job to `Cancelled`. Consumers observe the flag
    /// before they acknowledge and stop mutating.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let job = self
            .deps
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("job {job_id}")))?;
        if job.status.is_terminal() {
            return Err(ImagoError::Conflict(format!(
                "job {job_id} is already {:?}",
                job.status
            )));
        }
        self.deps
            .jobs
            .set_job_status(job_id, imago_model::JobStatus::Cancelled, None)
            .await
    }

    /// Creates a seeded per-collection job and publishes its
    /// collection-scan message. Stage totals are filled in by the scan
    /// consumer once it has enumerated the media.
    pub async fn enqueue_collection_scan(
        &self,
        collection: &Collection,
        force_rescan: bool,
    ) -> Result<JobId> {
        let mut job = BackgroundJob::new(JobKind::CollectionScan, Uuid::new_v4())
            .for_collection(collection.id)
            .for_library(collection.library_id)
            .with_stage(STAGE_SCAN, 0);
        if collection.settings.generate_thumbnails {
            job = job.with_stage(STAGE_THUMBNAIL, 0);
        }
        if collection.settings.generate_cache {
            job = job.with_stage(STAGE_CACHE, 0);
        }
        let job_id = job.id;
        self.deps.jobs.create(job).await?;

        let message = StageMessage::CollectionScan(CollectionScanMessage {
            collection_id: collection.id,
            collection_path: collection.path.clone(),
            collection_type: collection.kind,
            force_rescan,
            use_direct_file_access: collection.settings.use_direct_file_access,
            job_id,
        });
        publish_message(&*self.deps.broker, &message).await?;
        Ok(job_id)
    }
}
