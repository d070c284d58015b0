//! Shared data models for the Imago image-library service.
//!
//! Everything in this crate is plain data: typed identifiers, the
//! `Collection` and `BackgroundJob` aggregates, pipeline message payloads,
//! index projections, and sort-key arithmetic. No I/O lives here; the
//! engine crate (`imago-core`) owns the behaviour.

pub mod cache_folder;
pub mod collection;
pub mod ids;
pub mod job;
pub mod messages;
pub mod sort;
pub mod summary;

pub use cache_folder::CacheFolder;
pub use collection::{
    CacheImageEmbedded, Collection, CollectionSettings, CollectionStatistics, CollectionType,
    ImageEmbedded, ImageFormatTag, ThumbnailEmbedded,
};
pub use ids::{CacheFolderId, CollectionId, IdParseError, ImageId, JobId, LibraryId};
pub use job::{
    BackgroundJob, JobKind, JobStage, JobStatus, STAGE_CACHE, STAGE_SCAN, STAGE_THUMBNAIL,
    StageStatus,
};
pub use messages::{
    CollectionScanMessage, DerivativeGenMessage, ImageProcessMessage, ImageSource,
    LibraryScanMessage, MessageType, StageMessage,
};
pub use sort::{SortDirection, SortField, fnv1a64};
pub use summary::{CollectionIndexState, CollectionSummary};
