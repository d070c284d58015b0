//! Stage B: collection-scan.
//!
//! Enumerates a collection's media deterministically, appends images with
//! the idempotent add-if-absent operation, and either short-circuits into
//! direct-reference derivatives or fans out one image-process message per
//! newly added image.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use imago_model::{
    CollectionScanMessage, CollectionType, ImageEmbedded, ImageFormatTag, ImageId,
    ImageProcessMessage, MessageType, StageMessage, StageStatus, STAGE_CACHE, STAGE_SCAN,
    STAGE_THUMBNAIL,
};

use crate::broker::{Envelope, publish_message};
use crate::error::{ImagoError, Result};
use crate::media;
use crate::pipeline::library_scan::{direct_cache_image, direct_thumbnail, source_for};
use crate::pipeline::{PipelineDeps, StageConsumer, parse_body};
use crate::scanner::{self, archive};

pub struct CollectionScanConsumer {
    deps: PipelineDeps,
}

/// One media entry discovered during enumeration, dimensions already
/// probed where that was cheap.
struct DiscoveredEntry {
    filename: String,
    relative_path: String,
    byte_size: u64,
    width: u32,
    height: u32,
    format: ImageFormatTag,
}

impl CollectionScanConsumer {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    async fn enumerate(&self, msg: &CollectionScanMessage) -> Result<Vec<DiscoveredEntry>> {
        let path = msg.collection_path.clone();
        match msg.collection_type {
            CollectionType::Folder => {
                tokio::task::spawn_blocking(move || {
                    let images = scanner::list_folder_images(&path)?;
                    Ok(images
                        .into_iter()
                        .map(|img| {
                            // Eager probe; a failure still admits the image
                            // and image-process recomputes downstream.
                            let (width, height) = match media::probe_file(&img.absolute_path) {
                                Ok(probed) => (probed.width, probed.height),
                                Err(_) => (0, 0),
                            };
                            DiscoveredEntry {
                                filename: img.filename,
                                relative_path: img.relative_path,
                                byte_size: img.byte_size,
                                width,
                                height,
                                format: img.format,
                            }
                        })
                        .collect())
                })
                .await
                .map_err(|e| ImagoError::Internal(format!("scan task panicked: {e}")))?
            }
            CollectionType::Archive => {
                tokio::task::spawn_blocking(move || {
                    let entries = archive::list_archive_images(&path)?;
                    // Dimension extraction is deferred to image-process.
                    Ok(entries
                        .into_iter()
                        .map(|entry| DiscoveredEntry {
                            filename: entry.filename,
                            relative_path: entry.entry_name,
                            byte_size: entry.byte_size,
                            width: 0,
                            height: 0,
                            format: entry.format,
                        })
                        .collect())
                })
                .await
                .map_err(|e| ImagoError::Internal(format!("scan task panicked: {e}")))?
            }
        }
    }
}

#[async_trait]
impl StageConsumer for CollectionScanConsumer {
    fn message_type(&self) -> MessageType {
        MessageType::CollectionScan
    }

    async fn handle(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        let msg: CollectionScanMessage = parse_body(envelope)?;
        if self.deps.job_cancelled(&msg.job_id).await? {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(ImagoError::Cancelled("collection scan interrupted".into()));
        }

        let collection = self
            .deps
            .collections
            .get(&msg.collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;

        if msg.force_rescan {
            self.deps
                .collections
                .clear_image_arrays(&msg.collection_id)
                .await?;
        }

        let entries = match self.enumerate(&msg).await {
            Ok(entries) => entries,
            Err(e @ ImagoError::DataCorruption(_)) => {
                // Unreadable container: fail the scan stage once and stop
                // the run; images appended before the error remain.
                warn!(collection = %msg.collection_id, error = %e, "scan failed");
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

        let total = entries.len() as u64;
        self.deps
            .jobs
            .set_stage_total(&msg.job_id, STAGE_SCAN, total)
            .await?;
        if collection.settings.generate_thumbnails {
            self.deps
                .jobs
                .set_stage_total(&msg.job_id, STAGE_THUMBNAIL, total)
                .await?;
        }
        if collection.settings.generate_cache {
            self.deps
                .jobs
                .set_stage_total(&msg.job_id, STAGE_CACHE, total)
                .await?;
        }

        if entries.is_empty() {
            // Nothing to do; close every seeded stage so the monitor can
            // finish the job.
            for stage in [STAGE_SCAN, STAGE_THUMBNAIL, STAGE_CACHE] {
                self.deps.jobs.close_stage(&msg.job_id, stage, 0).await?;
            }
            let refreshed = self
                .deps
                .collections
                .get(&msg.collection_id)
                .await?
                .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;
            self.deps.index.upsert_collection(&refreshed).await?;
            return Ok(());
        }

        let mut newly_added: Vec<ImageId> = Vec::new();
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(ImagoError::Cancelled("collection scan interrupted".into()));
            }
            let image = ImageEmbedded {
                id: ImageId::generate(),
                filename: entry.filename,
                relative_path: entry.relative_path,
                byte_size: entry.byte_size,
                width: entry.width,
                height: entry.height,
                format: entry.format,
            };
            let image_id = image.id;
            if self
                .deps
                .collections
                .add_image_if_absent(&msg.collection_id, image)
                .await?
            {
                newly_added.push(image_id);
            }
        }

        let direct =
            msg.use_direct_file_access && msg.collection_type == CollectionType::Folder;
        let refreshed = self
            .deps
            .collections
            .get(&msg.collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;

        if direct {
            // Direct-reference mode: no derivative bytes, stages close now.
            let thumbnails: Vec<_> = refreshed
                .images_missing_thumbnails()
                .into_iter()
                .map(|img| direct_thumbnail(&refreshed, img))
                .collect();
            let cache_entries: Vec<_> = refreshed
                .images_missing_cache()
                .into_iter()
                .map(|img| direct_cache_image(&refreshed, img))
                .collect();
            if !thumbnails.is_empty() {
                self.deps
                    .collections
                    .add_thumbnails(&msg.collection_id, thumbnails)
                    .await?;
            }
            if !cache_entries.is_empty() {
                self.deps
                    .collections
                    .add_cache_images(&msg.collection_id, cache_entries)
                    .await?;
            }
            self.deps
                .jobs
                .close_stage(&msg.job_id, STAGE_SCAN, total)
                .await?;
            if refreshed.settings.generate_thumbnails {
                self.deps
                    .jobs
                    .close_stage(&msg.job_id, STAGE_THUMBNAIL, total)
                    .await?;
            }
            if refreshed.settings.generate_cache {
                self.deps
                    .jobs
                    .close_stage(&msg.job_id, STAGE_CACHE, total)
                    .await?;
            }
        } else {
            for image_id in &newly_added {
                let Some(image) = refreshed.image(image_id) else {
                    continue;
                };
                let message = StageMessage::ImageProcess(ImageProcessMessage {
                    collection_id: msg.collection_id,
                    image_id: *image_id,
                    source: source_for(&refreshed, image),
                    scan_job_id: msg.job_id,
                });
                publish_message(&*self.deps.broker, &message).await?;
            }
        }

        let final_state = self
            .deps
            .collections
            .get(&msg.collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;
        self.deps.index.upsert_collection(&final_state).await?;

        info!(
            collection = %msg.collection_id,
            images = total,
            new = newly_added.len(),
            direct,
            "collection scan finished"
        );
        Ok(())
    }
}
