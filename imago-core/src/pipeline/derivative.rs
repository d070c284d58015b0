//! Stages D and E: thumbnail-gen and cache-gen.
//!
//! Identical structure, different target box and stage name. Idempotent by
//! pre-check: a derivative that already exists on disk and in the
//! aggregate acknowledges without doing work, which is what makes DLQ
//! replay and broker redelivery safe.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use imago_model::{
    CacheImageEmbedded, Collection, DerivativeGenMessage, ImageFormatTag, ImageSource,
    MessageType, StageStatus, ThumbnailEmbedded, STAGE_CACHE, STAGE_THUMBNAIL,
};

use crate::error::{ImagoError, Result};
use crate::broker::Envelope;
use crate::media;
use crate::pipeline::{PipelineDeps, StageConsumer, parse_body};
use crate::scanner::archive;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivativeKind {
    Thumbnail,
    Cache,
}

impl DerivativeKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            DerivativeKind::Thumbnail => MessageType::ThumbnailGen,
            DerivativeKind::Cache => MessageType::CacheGen,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            DerivativeKind::Thumbnail => STAGE_THUMBNAIL,
            DerivativeKind::Cache => STAGE_CACHE,
        }
    }
}

pub struct DerivativeConsumer {
    deps: PipelineDeps,
    kind: DerivativeKind,
}

impl DerivativeConsumer {
    pub fn new(deps: PipelineDeps, kind: DerivativeKind) -> Self {
        Self { deps, kind }
    }

    /// Idempotence pre-check: entry present and backing file readable.
    async fn already_done(&self, collection: &Collection, msg: &DerivativeGenMessage) -> bool {
        let (path, is_direct) = match self.kind {
            DerivativeKind::Thumbnail => match collection.thumbnail_for(&msg.image_id) {
                Some(entry) => (entry.path.clone(), entry.is_direct),
                None => return false,
            },
            DerivativeKind::Cache => match collection.cache_image_for(&msg.image_id) {
                Some(entry) => (entry.path.clone(), entry.is_direct),
                None => return false,
            },
        };
        is_direct || tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    async fn load_source(&self, source: &ImageSource) -> Result<Vec<u8>> {
        match source {
            ImageSource::File { path } => {
                tokio::fs::read(path).await.map_err(|e| match e.kind() {
                    ErrorKind::NotFound => ImagoError::DataCorruption(format!(
                        "original file vanished: {}",
                        path.display()
                    )),
                    _ => ImagoError::TransientIo(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )),
                })
            }
            ImageSource::ArchiveEntry {
                archive_path,
                entry_name,
            } => {
                let archive_path = archive_path.clone();
                let entry_name = entry_name.clone();
                tokio::task::spawn_blocking(move || {
                    archive::read_archive_entry(&archive_path, &entry_name)
                })
                .await
                .map_err(|e| ImagoError::Internal(format!("extract task panicked: {e}")))?
            }
        }
    }

    fn destination(&self, root: &PathBuf, msg: &DerivativeGenMessage) -> PathBuf {
        // {cacheRoot}/{idPrefix}/{collectionId}/{imageId}.jpg — stable per
        // collection so the pre-check finds earlier runs' output.
        root.join(msg.collection_id.prefix())
            .join(msg.collection_id.to_string())
            .join(format!("{}.jpg", msg.image_id))
    }
}

#[async_trait]
impl StageConsumer for DerivativeConsumer {
    fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    async fn handle(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()> {
        let msg: DerivativeGenMessage = parse_body(envelope)?;
        if self.deps.job_cancelled(&msg.scan_job_id).await? {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(ImagoError::Cancelled("derivative generation interrupted".into()));
        }

        let collection = self
            .deps
            .collections
            .get(&msg.collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;

        if self.already_done(&collection, &msg).await {
            debug!(
                collection = %msg.collection_id,
                image = %msg.image_id,
                stage = self.kind.stage(),
                "derivative already present; skipping"
            );
            return Ok(());
        }

        let rendered = match self.load_source(&msg.source).await {
            Ok(bytes) => {
                let (width, height, quality) = (msg.width, msg.height, msg.quality);
                let render = tokio::task::spawn_blocking(move || {
                    media::render_jpeg(&bytes, width, height, quality)
                })
                .await
                .map_err(|e| ImagoError::Internal(format!("render task panicked: {e}")))?;
                render
            }
            Err(e) => Err(e),
        };
        let rendered = match rendered {
            Ok(rendered) => rendered,
            Err(e @ (ImagoError::DataCorruption(_) | ImagoError::NotFound(_))) => {
                // Unreadable source: fail this stage once, acknowledge.
                warn!(
                    collection = %msg.collection_id,
                    image = %msg.image_id,
                    stage = self.kind.stage(),
                    error = %e,
                    "derivative source unreadable"
                );
                self.deps
                    .jobs
                    .set_stage_status(
                        &msg.scan_job_id,
                        self.kind.stage(),
                        StageStatus::Failed,
                        Some(e.to_string()),
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let byte_size = rendered.bytes.len() as u64;
        let folder = self
            .deps
            .cache_folders
            .find_active_lowest_priority(byte_size)
            .await?
            .ok_or_else(|| {
                ImagoError::TransientIo("no cache folder has remaining capacity".into())
            })?;

        let destination = self.destination(&folder.path, &msg);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ImagoError::TransientIo(format!("mkdir failed: {e}")))?;
        }
        // Temp-file-then-rename: readers never observe a half-written
        // derivative.
        let temp = destination.with_file_name(format!(".{}.{}.tmp", msg.image_id, Uuid::new_v4()));
        tokio::fs::write(&temp, &rendered.bytes)
            .await
            .map_err(|e| ImagoError::TransientIo(format!("derivative write failed: {e}")))?;
        tokio::fs::rename(&temp, &destination)
            .await
            .map_err(|e| ImagoError::TransientIo(format!("derivative rename failed: {e}")))?;

        let added = match self.kind {
            DerivativeKind::Thumbnail => {
                self.deps
                    .collections
                    .add_thumbnails(
                        &msg.collection_id,
                        vec![ThumbnailEmbedded {
                            image_id: msg.image_id,
                            path: destination.clone(),
                            width: rendered.width,
                            height: rendered.height,
                            byte_size,
                            format: ImageFormatTag::Jpeg,
                            is_direct: false,
                        }],
                    )
                    .await?
            }
            DerivativeKind::Cache => {
                self.deps
                    .collections
                    .add_cache_images(
                        &msg.collection_id,
                        vec![CacheImageEmbedded {
                            image_id: msg.image_id,
                            path: destination.clone(),
                            width: rendered.width,
                            height: rendered.height,
                            byte_size,
                            format: ImageFormatTag::Jpeg,
                            is_direct: false,
                        }],
                    )
                    .await?
            }
        };
        if added > 0 {
            // One compound update on the folder document.
            self.deps
                .cache_folders
                .increment_stats(&folder.id, byte_size as i64, 1, &msg.collection_id)
                .await?;
        }

        self.deps
            .jobs
            .increment_stage(&msg.scan_job_id, self.kind.stage(), 1)
            .await?;

        // Refresh the projection when the summary visibly changes: the
        // first image's thumbnail feeds the data-URL, and full coverage
        // clears the incomplete flag. The reconciler handles the rest.
        let first_image_thumb = self.kind == DerivativeKind::Thumbnail
            && collection.first_image().is_some_and(|img| img.id == msg.image_id);
        let refreshed = self
            .deps
            .collections
            .get(&msg.collection_id)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {}", msg.collection_id)))?;
        let fully_covered = refreshed.images_missing_thumbnails().is_empty()
            && refreshed.images_missing_cache().is_empty();
        if first_image_thumb || fully_covered {
            self.deps.index.upsert_collection(&refreshed).await?;
        }
        Ok(())
    }
}
