//! Stage C: image-process.
//!
//! Probes just enough of the original to learn `(width, height, format)`,
//! writes the dimensions into the aggregate, and fans out the derivative
//! messages. The scan-stage increment here is the authoritative
//! scan-complete marker for the image.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use imago_model::{
    DerivativeGenMessage, ImageProcessMessage, ImageSource, MessageType, StageMessage, STAGE_CACHE,
    STAGE_SCAN, STAGE_THUMBNAIL,
};

use crate::broker::{Envelope, publish_message};
use crate::error::{ImagoError, Result};
use crate::media::{self, ProbedImage};
use crate::pipeline::{PipelineDeps, StageConsumer, parse_body};
use crate::scanner::archive;

pub struct ImageProcessConsumer {
    deps: PipelineDeps,
}

impl ImageProcessConsumer {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    async fn probe_source(&self, source: &ImageSource) -> Result<ProbedImage> {
        match source {
            ImageSource::File { path } => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || media::probe_file(&path))
                    .await
                    .map_err(|e| ImagoError::Internal(format!("probe task panicked: {e}")))?
            }
            ImageSource::ArchiveEntry {
                archive_path,
                entry_name,
            } => {
                let archive_path = archive_path.clone();
                let entry_name = entry_name.clone();
                tokio::task::spawn_blocking(move || {
                    let bytes = archive::read_archive_entry(&archive_path, &entry_name)?;
                    media::probe_bytes(&bytes)
                })
                .await
                .map_err(|e| ImagoError::Internal(format!("probe task panicked: {e}")))?
            }
        }
    }
}

#[async_trait]
impl StageConsumer for ImageProcessConsumer {
    fn message_type(&self) -> MessageType {
        MessageType::ImageProcess
    }

    async fn handle(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        let msg: ImageProcessMessage = parse_body(envelope)?;
        if self.deps.job_cancelled(&msg.scan_job_id).await? {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(ImagoError::Cancelled("image processing interrupted".into()));
        }

        let collection = self
            .deps
            .collections
            .get(&msg.collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;

        let probed = match self.probe_source(&msg.source).await {
            Ok(probed) => probed,
            Err(e @ (ImagoError::DataCorruption(_) | ImagoError::NotFound(_))) => {
                // One corrupted image fails only its own processing and
                // derivative chain; the scan stage keeps moving.
                warn!(
                    collection = %msg.collection_id,
                    image = %msg.image_id,
                    error = %e,
                    "image unreadable; dropping its derivative work"
                );
                if !collection.direct_access() {
                    if collection.settings.generate_thumbnails {
                        self.deps
                            .jobs
                            .adjust_stage_total(&msg.scan_job_id, STAGE_THUMBNAIL, -1)
                            .await?;
                    }
                    if collection.settings.generate_cache {
                        self.deps
                            .jobs
                            .adjust_stage_total(&msg.scan_job_id, STAGE_CACHE, -1)
                            .await?;
                    }
                }
                self.deps
                    .jobs
                    .increment_stage(&msg.scan_job_id, STAGE_SCAN, 1)
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.deps
            .collections
            .set_image_dimensions(
                &msg.collection_id,
                &msg.image_id,
                probed.width,
                probed.height,
                probed.format,
            )
            .await?;

        if !collection.direct_access() {
            if collection.settings.generate_thumbnails {
                let target = self.deps.config.thumbnail_target();
                let message = StageMessage::ThumbnailGen(DerivativeGenMessage {
                    collection_id: msg.collection_id,
                    image_id: msg.image_id,
                    source: msg.source.clone(),
                    scan_job_id: msg.scan_job_id,
                    width: target.width,
                    height: target.height,
                    quality: target.quality,
                });
                publish_message(&*self.deps.broker, &message).await?;
            }
            if collection.settings.generate_cache {
                let target = self.deps.config.view_cache_target();
                let message = StageMessage::CacheGen(DerivativeGenMessage {
                    collection_id: msg.collection_id,
                    image_id: msg.image_id,
                    source: msg.source.clone(),
                    scan_job_id: msg.scan_job_id,
                    width: target.width,
                    height: target.height,
                    quality: target.quality,
                });
                publish_message(&*self.deps.broker, &message).await?;
            }
        }

        self.deps
            .jobs
            .increment_stage(&msg.scan_job_id, STAGE_SCAN, 1)
            .await?;
        Ok(())
    }
}
