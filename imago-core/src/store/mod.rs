//! Document-store ports.
//!
//! The aggregates live in an external document store; the engine only
//! speaks to these repository traits. Every method is a single atomic
//! command: it either commits the whole compound update or returns an
//! error. Concurrent workers touching the same aggregate stay correct
//! because all writes are commutative increments or set-additions on
//! disjoint keys — there is no read-modify-write anywhere above this
//! boundary.

mod memory;

pub use memory::MemoryStore;

use std::path::Path;

use async_trait::async_trait;

use imago_model::{
    BackgroundJob, CacheFolder, CacheFolderId, CacheImageEmbedded, Collection, CollectionId,
    CollectionSettings, ImageEmbedded, ImageFormatTag, ImageId, JobId, JobStatus, LibraryId,
    StageStatus, ThumbnailEmbedded,
};

use crate::error::Result;

#[async_trait]
pub trait CollectionRepository: Send + Sync {
    /// Creates the aggregate; `Conflict` when a live collection already
    /// claims the same path.
    async fn create(&self, collection: Collection) -> Result<()>;

    async fn get(&self, id: &CollectionId) -> Result<Option<Collection>>;

    async fn find_by_path(&self, path: &Path) -> Result<Option<Collection>>;

    async fn find_by_library(&self, library_id: &LibraryId) -> Result<Vec<Collection>>;

    /// Every collection document, soft-deleted included; rebuild and
    /// reconciliation need the tombstones.
    async fn list_all(&self) -> Result<Vec<Collection>>;

    /// Add-if-absent keyed on `(filename, relative_path)`. Returns whether
    /// the image was appended; statistics and `updated_at` move in the
    /// same write.
    async fn add_image_if_absent(&self, id: &CollectionId, image: ImageEmbedded) -> Result<bool>;

    /// In-place dimension/format update addressed by image id.
    async fn set_image_dimensions(
        &self,
        id: &CollectionId,
        image_id: &ImageId,
        width: u32,
        height: u32,
        format: ImageFormatTag,
    ) -> Result<()>;

    /// Appends thumbnail entries, skipping any `(image_id, width, height)`
    /// already present. Returns the number actually added.
    async fn add_thumbnails(
        &self,
        id: &CollectionId,
        entries: Vec<ThumbnailEmbedded>,
    ) -> Result<u64>;

    /// Appends cache entries, skipping any `image_id` already present.
    async fn add_cache_images(
        &self,
        id: &CollectionId,
        entries: Vec<CacheImageEmbedded>,
    ) -> Result<u64>;

    /// Compound reset of `images`, `thumbnails`, `cacheImages`, and the
    /// statistics block.
    async fn clear_image_arrays(&self, id: &CollectionId) -> Result<()>;

    async fn update_settings(&self, id: &CollectionId, settings: CollectionSettings) -> Result<()>;

    async fn soft_delete(&self, id: &CollectionId) -> Result<()>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persists the job with its stages map already seeded. Consumers may
    /// only increment stages that exist, so creation happens before the
    /// first message is published.
    async fn create(&self, job: BackgroundJob) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<Option<BackgroundJob>>;

    async fn list_active(&self) -> Result<Vec<BackgroundJob>>;

    /// Single-expression atomic increment of a stage counter. An
    /// increment against a missing stage is silently lost, mirroring the
    /// document-store `$inc` on an absent path.
    async fn increment_stage(&self, id: &JobId, stage: &str, by: u64) -> Result<()>;

    async fn set_stage_total(&self, id: &JobId, stage: &str, total_items: u64) -> Result<()>;

    /// Atomic `$inc` on a stage's planned total, clamped at zero. Used
    /// when a corrupted image drops out of the derivative stages.
    async fn adjust_stage_total(&self, id: &JobId, stage: &str, delta: i64) -> Result<()>;

    async fn set_stage_status(
        &self,
        id: &JobId,
        stage: &str,
        status: StageStatus,
        message: Option<String>,
    ) -> Result<()>;

    /// Marks a stage `Completed`, correcting `completed_items` to the
    /// observed value in the same write.
    async fn close_stage(&self, id: &JobId, stage: &str, completed_items: u64) -> Result<()>;

    async fn set_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()>;

    /// Terminal rollup: aggregates stage counters, sets 100 %, stamps
    /// `completed_at`, and flips the status to `Completed`.
    async fn complete_job(&self, id: &JobId) -> Result<()>;
}

#[async_trait]
pub trait CacheFolderRepository: Send + Sync {
    async fn insert(&self, folder: CacheFolder) -> Result<()>;

    async fn list(&self) -> Result<Vec<CacheFolder>>;

    /// Lowest-priority enabled folder with room for `estimated_bytes`.
    async fn find_active_lowest_priority(
        &self,
        estimated_bytes: u64,
    ) -> Result<Option<CacheFolder>>;

    /// One compound update: size and file-count deltas plus membership of
    /// `collection_id` in the folder's cached set.
    async fn increment_stats(
        &self,
        id: &CacheFolderId,
        size_delta: i64,
        file_delta: i64,
        collection_id: &CollectionId,
    ) -> Result<()>;
}
