//! Index projections: the denormalized `CollectionSummary` served on
//! listing pages and the `CollectionIndexState` marker the reconciler uses
//! to decide skip / rebuild / orphan.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collection::{Collection, CollectionType};
use crate::ids::{CollectionId, ImageId, LibraryId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    pub id: CollectionId,
    pub name: String,
    pub first_image_id: Option<ImageId>,
    pub image_count: u64,
    pub thumbnail_count: u64,
    pub cache_count: u64,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub library_id: LibraryId,
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub path: PathBuf,
    /// Pre-encoded base64 data-URL of the first thumbnail, when small
    /// enough to inline.
    pub thumbnail_data_url: Option<String>,
    /// Set when derivative processing has not (yet) covered every image.
    pub incomplete: bool,
}

impl CollectionSummary {
    /// Projects the aggregate without an inlined thumbnail; the index
    /// service fills `thumbnail_data_url` separately.
    pub fn project(collection: &Collection) -> Self {
        let image_count = collection.images.len() as u64;
        let covered = if collection.direct_access() {
            image_count
        } else {
            collection.thumbnails.len() as u64
        };
        Self {
            id: collection.id,
            name: collection.name.clone(),
            first_image_id: collection.first_image().map(|img| img.id),
            image_count,
            thumbnail_count: collection.thumbnails.len() as u64,
            cache_count: collection.cache_images.len() as u64,
            total_size: collection.statistics.total_size,
            created_at: collection.created_at,
            updated_at: collection.updated_at,
            library_id: collection.library_id,
            kind: collection.kind,
            path: collection.path.clone(),
            thumbnail_data_url: None,
            incomplete: covered < image_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionIndexState {
    pub indexed_at: DateTime<Utc>,
    pub collection_updated_at: DateTime<Utc>,
    pub image_count: u64,
    pub thumbnail_count: u64,
    pub cache_count: u64,
    pub has_first_thumbnail: bool,
}

impl CollectionIndexState {
    pub fn capture(collection: &Collection, has_first_thumbnail: bool) -> Self {
        Self {
            indexed_at: Utc::now(),
            collection_updated_at: collection.updated_at,
            image_count: collection.images.len() as u64,
            thumbnail_count: collection.thumbnails.len() as u64,
            cache_count: collection.cache_images.len() as u64,
            has_first_thumbnail,
        }
    }

    /// True when the aggregate has advanced past what the index recorded.
    pub fn is_stale_for(&self, collection: &Collection) -> bool {
        collection.updated_at > self.collection_updated_at
    }
}
