//! Stage A: library-scan.
//!
//! Walks the library root, decides per candidate between create, overwrite,
//! resume, and skip, and fans out collection-scan messages. A failing
//! candidate is recorded on the orchestrator job but never aborts its
//! siblings.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use imago_model::{
    BackgroundJob, CacheImageEmbedded, Collection, CollectionSettings, CollectionType,
    DerivativeGenMessage, ImageEmbedded, ImageSource, JobKind, LibraryScanMessage, MessageType,
    StageMessage, StageStatus, ThumbnailEmbedded, STAGE_CACHE, STAGE_SCAN, STAGE_THUMBNAIL,
};
use uuid::Uuid;

use crate::broker::{Envelope, publish_message};
use crate::error::{ImagoError, Result};
use crate::orchestrator::ScanOrchestrator;
use crate::pipeline::{PipelineDeps, StageConsumer, parse_body};
use crate::scanner::{self, CollectionCandidate};

pub struct LibraryScanConsumer {
    deps: PipelineDeps,
    orchestrator: ScanOrchestrator,
}

impl LibraryScanConsumer {
    pub fn new(deps: PipelineDeps) -> Self {
        let orchestrator = ScanOrchestrator::new(deps.clone());
        Self { deps, orchestrator }
    }

    async fn process_candidate(
        &self,
        msg: &LibraryScanMessage,
        candidate: &CollectionCandidate,
    ) -> Result<()> {
        match self.deps.collections.find_by_path(&candidate.path).await? {
            None => {
                let settings = CollectionSettings {
                    auto_scan: msg.auto_scan,
                    use_direct_file_access: msg.use_direct_file_access,
                    ..CollectionSettings::default()
                };
                let collection = Collection::new(
                    candidate.name.clone(),
                    candidate.path.clone(),
                    candidate.kind,
                    msg.library_id,
                    settings,
                );
                let id = collection.id;
                self.deps.collections.create(collection).await?;
                let collection = self.load(&id).await?;
                self.deps.index.upsert_collection(&collection).await?;
                self.orchestrator
                    .enqueue_collection_scan(&collection, false)
                    .await?;
            }
            Some(existing) if msg.overwrite_existing => {
                self.deps.collections.clear_image_arrays(&existing.id).await?;
                self.apply_direct_setting(&existing, msg.use_direct_file_access).await?;
                let refreshed = self.load(&existing.id).await?;
                self.orchestrator
                    .enqueue_collection_scan(&refreshed, true)
                    .await?;
            }
            Some(existing) if msg.resume_incomplete && !existing.images.is_empty() => {
                self.resume_collection(msg, &existing).await?;
            }
            Some(existing) if !existing.images.is_empty() => {
                // Already scanned and neither overwrite nor resume: skip.
            }
            Some(existing) => {
                self.apply_direct_setting(&existing, msg.use_direct_file_access).await?;
                let refreshed = self.load(&existing.id).await?;
                self.orchestrator
                    .enqueue_collection_scan(&refreshed, false)
                    .await?;
            }
        }
        Ok(())
    }

    async fn load(&self, id: &imago_model::CollectionId) -> Result<Collection> {
        self.deps
            .collections
            .get(id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))
    }

    async fn apply_direct_setting(&self, collection: &Collection, direct: bool) -> Result<()> {
        if collection.settings.use_direct_file_access != direct {
            let mut settings = collection.settings;
            settings.use_direct_file_access = direct;
            self.deps
                .collections
                .update_settings(&collection.id, settings)
                .await?;
        }
        Ok(())
    }

    /// Resume: the collection is scanned; enqueue only the missing
    /// derivative work, with stage totals known at job-creation time.
    async fn resume_collection(
        &self,
        msg: &LibraryScanMessage,
        existing: &Collection,
    ) -> Result<()> {
        let missing_thumbnails: Vec<ImageEmbedded> = if existing.settings.generate_thumbnails {
            existing
                .images_missing_thumbnails()
                .into_iter()
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let missing_cache: Vec<ImageEmbedded> = if existing.settings.generate_cache {
            existing.images_missing_cache().into_iter().cloned().collect()
        } else {
            Vec::new()
        };
        if missing_thumbnails.is_empty() && missing_cache.is_empty() {
            return Ok(());
        }

        // Stages must exist before any consumer can increment them.
        let mut job = BackgroundJob::new(JobKind::CollectionScan, Uuid::new_v4())
            .for_collection(existing.id)
            .for_library(existing.library_id);
        if !missing_thumbnails.is_empty() {
            job = job.with_stage(STAGE_THUMBNAIL, missing_thumbnails.len() as u64);
        }
        if !missing_cache.is_empty() {
            job = job.with_stage(STAGE_CACHE, missing_cache.len() as u64);
        }
        let job_id = job.id;
        self.deps.jobs.create(job).await?;

        let direct = msg.use_direct_file_access && existing.kind == CollectionType::Folder;
        if direct {
            self.apply_direct_setting(existing, true).await?;
            let thumbnails: Vec<ThumbnailEmbedded> = missing_thumbnails
                .iter()
                .map(|img| direct_thumbnail(existing, img))
                .collect();
            let cache_entries: Vec<CacheImageEmbedded> = missing_cache
                .iter()
                .map(|img| direct_cache_image(existing, img))
                .collect();
            if !thumbnails.is_empty() {
                self.deps
                    .collections
                    .add_thumbnails(&existing.id, thumbnails)
                    .await?;
                self.deps
                    .jobs
                    .close_stage(&job_id, STAGE_THUMBNAIL, missing_thumbnails.len() as u64)
                    .await?;
            }
            if !cache_entries.is_empty() {
                self.deps
                    .collections
                    .add_cache_images(&existing.id, cache_entries)
                    .await?;
                self.deps
                    .jobs
                    .close_stage(&job_id, STAGE_CACHE, missing_cache.len() as u64)
                    .await?;
            }
            let refreshed = self.load(&existing.id).await?;
            self.deps.index.upsert_collection(&refreshed).await?;
            return Ok(());
        }

        let thumbnail = self.deps.config.thumbnail_target();
        for image in &missing_thumbnails {
            let message = StageMessage::ThumbnailGen(DerivativeGenMessage {
                collection_id: existing.id,
                image_id: image.id,
                source: source_for(existing, image),
                scan_job_id: job_id,
                width: thumbnail.width,
                height: thumbnail.height,
                quality: thumbnail.quality,
            });
            publish_message(&*self.deps.broker, &message).await?;
        }
        let view = self.deps.config.view_cache_target();
        for image in &missing_cache {
            let message = StageMessage::CacheGen(DerivativeGenMessage {
                collection_id: existing.id,
                image_id: image.id,
                source: source_for(existing, image),
                scan_job_id: job_id,
                width: view.width,
                height: view.height,
                quality: view.quality,
            });
            publish_message(&*self.deps.broker, &message).await?;
        }
        info!(
            collection = %existing.id,
            thumbnails = missing_thumbnails.len(),
            cache = missing_cache.len(),
            "resume enqueued missing derivatives"
        );
        Ok(())
    }
}

/// Source locator for an embedded image, folder or archive entry.
pub(crate) fn source_for(collection: &Collection, image: &ImageEmbedded) -> ImageSource {
    match collection.kind {
        CollectionType::Folder => ImageSource::File {
            path: collection.path.join(&image.relative_path),
        },
        CollectionType::Archive => ImageSource::ArchiveEntry {
            archive_path: collection.path.clone(),
            entry_name: image.relative_path.clone(),
        },
    }
}

pub(crate) fn direct_thumbnail(collection: &Collection, image: &ImageEmbedded) -> ThumbnailEmbedded {
    ThumbnailEmbedded {
        image_id: image.id,
        path: collection.path.join(&image.relative_path),
        width: image.width,
        height: image.height,
        byte_size: image.byte_size,
        format: image.format,
        is_direct: true,
    }
}

pub(crate) fn direct_cache_image(
    collection: &Collection,
    image: &ImageEmbedded,
) -> CacheImageEmbedded {
    CacheImageEmbedded {
        image_id: image.id,
        path: collection.path.join(&image.relative_path),
        width: image.width,
        height: image.height,
        byte_size: image.byte_size,
        format: image.format,
        is_direct: true,
    }
}

#[async_trait]
impl StageConsumer for LibraryScanConsumer {
    fn message_type(&self) -> MessageType {
        MessageType::LibraryScan
    }

    async fn handle(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        let msg: LibraryScanMessage = parse_body(envelope)?;
        if self.deps.job_cancelled(&msg.job_id).await? {
            return Ok(());
        }

        let root = msg.library_path.clone();
        let include_subfolders = msg.include_subfolders;
        let candidates = tokio::task::spawn_blocking(move || {
            scanner::discover_candidates(&root, include_subfolders)
        })
        .await
        .map_err(|e| ImagoError::Internal(format!("walk task panicked: {e}")))?;

        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(e @ ImagoError::Validation(_)) => {
                // Unusable library root: fail the orchestrator job's scan
                // stage and stop; nothing to retry.
                self.deps
                    .jobs
                    .set_stage_status(
                        &msg.job_id,
                        STAGE_SCAN,
                        StageStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.deps
            .jobs
            .set_stage_total(&msg.job_id, STAGE_SCAN, candidates.len() as u64)
            .await?;
        info!(
            library = %msg.library_id,
            candidates = candidates.len(),
            "library walk finished"
        );
        if candidates.is_empty() {
            self.deps.jobs.close_stage(&msg.job_id, STAGE_SCAN, 0).await?;
            return Ok(());
        }

        let mut failed = 0u64;
        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(ImagoError::Cancelled("library scan interrupted".into()));
            }
            if let Err(e) = self.process_candidate(&msg, candidate).await {
                // Sibling collection-scans keep going.
                warn!(
                    candidate = %candidate.path.display(),
                    error = %e,
                    "candidate failed during library scan"
                );
                failed += 1;
            }
            self.deps
                .jobs
                .increment_stage(&msg.job_id, STAGE_SCAN, 1)
                .await?;
        }
        if failed > 0 {
            self.deps
                .jobs
                .set_stage_status(
                    &msg.job_id,
                    STAGE_SCAN,
                    StageStatus::InProgress,
                    Some(format!("{failed} of {} candidates failed", candidates.len())),
                )
                .await?;
        }
        Ok(())
    }
}
