//! Redis-backed cross-collection index.
//!
//! Answers the four listing-shaped queries (page, position, neighbors,
//! count) in O(log N) against sorted sets keyed per `(field, direction)`,
//! with pre-inverted scores so every read is one ascending rank range.
//! Summaries are denormalized JSON blobs fetched with a single MGET per
//! page.

mod memory;
mod rebuild;
mod redis;
mod store;

pub use memory::MemoryIndexStore;
pub use rebuild::{IndexReconciler, RebuildMode, RebuildOptions, RebuildReport};
pub use self::redis::RedisIndexStore;
pub use store::IndexStore;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use imago_model::{
    Collection, CollectionId, CollectionIndexState, CollectionSummary, CollectionType,
    ImageFormatTag, LibraryId, SortDirection, SortField,
};

use crate::config::ImagoConfig;
use crate::error::{ImagoError, Result};
use crate::media;
use crate::store::CollectionRepository;

/// Inline a thumbnail into the summary only under this size.
const INLINE_MAX_BYTES: u64 = 500 * 1024;
/// ... and only when it fits the thumbnail box.
const INLINE_MAX_DIM: u32 = 400;
/// Direct-reference originals are resized in memory to this box before
/// inlining, so the index never stores full-resolution data-URLs.
const DIRECT_INLINE_DIM: u32 = 300;
const DIRECT_INLINE_QUALITY: u8 = 85;

/// Key builders for everything under the index prefix.
#[derive(Clone, Debug)]
pub struct IndexKeys {
    prefix: String,
}

impl IndexKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn sorted(&self, field: SortField, dir: SortDirection) -> String {
        format!("{}sorted:{}:{}", self.prefix, field, dir)
    }

    pub fn sorted_by_library(
        &self,
        library_id: &LibraryId,
        field: SortField,
        dir: SortDirection,
    ) -> String {
        format!(
            "{}sorted:by_library:{}:{}:{}",
            self.prefix, library_id, field, dir
        )
    }

    pub fn sorted_by_type(
        &self,
        kind: CollectionType,
        field: SortField,
        dir: SortDirection,
    ) -> String {
        format!(
            "{}sorted:by_type:{}:{}:{}",
            self.prefix,
            kind.as_str(),
            field,
            dir
        )
    }

    pub fn data(&self, id: &CollectionId) -> String {
        format!("{}data:{id}", self.prefix)
    }

    pub fn state(&self, id: &CollectionId) -> String {
        format!("{}state:{id}", self.prefix)
    }

    pub fn thumb(&self, id: &CollectionId) -> String {
        format!("{}thumb:{id}", self.prefix)
    }

    pub fn stats_total(&self) -> String {
        format!("{}stats:total", self.prefix)
    }

    pub fn last_rebuild(&self) -> String {
        format!("{}last_rebuild", self.prefix)
    }

    pub fn state_pattern(&self) -> String {
        format!("{}state:*", self.prefix)
    }

    pub fn all_pattern(&self) -> String {
        format!("{}*", self.prefix)
    }

    pub fn thumb_prefix(&self) -> String {
        format!("{}thumb:", self.prefix)
    }

    fn state_key_to_id(&self, key: &str) -> Option<CollectionId> {
        key.strip_prefix(&format!("{}state:", self.prefix))
            .and_then(|id| id.parse().ok())
    }

    /// Every sorted-set key a summary belongs to.
    fn sorted_keys_for(&self, summary: &CollectionSummary) -> Vec<String> {
        let mut keys = Vec::with_capacity(30);
        for field in SortField::ALL {
            for dir in SortDirection::ALL {
                keys.push(self.sorted(field, dir));
                keys.push(self.sorted_by_library(&summary.library_id, field, dir));
                keys.push(self.sorted_by_type(summary.kind, field, dir));
            }
        }
        keys
    }
}

/// Optional secondary-filter dimension for listing queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListFilter {
    Library(LibraryId),
    Type(CollectionType),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub items: Vec<CollectionSummary>,
    pub page: i64,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResult {
    pub rank1_based: u64,
    pub total: u64,
    pub prev_id: Option<CollectionId>,
    pub next_id: Option<CollectionId>,
}

pub struct IndexService {
    store: Arc<dyn IndexStore>,
    collections: Arc<dyn CollectionRepository>,
    keys: IndexKeys,
    thumb_ttl: Duration,
    rebuild_batch_size: usize,
}

impl std::fmt::Debug for IndexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexService")
            .field("keys", &self.keys)
            .finish()
    }
}

impl IndexService {
    pub fn new(
        store: Arc<dyn IndexStore>,
        collections: Arc<dyn CollectionRepository>,
        config: &ImagoConfig,
    ) -> Self {
        Self {
            store,
            collections,
            keys: IndexKeys::new(config.index.key_prefix.clone()),
            thumb_ttl: Duration::from_secs(u64::from(config.index.thumb_ttl_days) * 24 * 3600),
            rebuild_batch_size: config.index.rebuild_batch_size,
        }
    }

    pub fn keys(&self) -> &IndexKeys {
        &self.keys
    }

    pub(crate) fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub(crate) fn collections(&self) -> &Arc<dyn CollectionRepository> {
        &self.collections
    }

    pub(crate) fn rebuild_batch_size(&self) -> usize {
        self.rebuild_batch_size
    }

    /// Writes the full projection of one collection: every sorted set it
    /// belongs to, its summary blob, and its index state. A soft-deleted
    /// aggregate is removed instead.
    pub async fn upsert_collection(&self, collection: &Collection) -> Result<()> {
        self.upsert_with(collection, false).await
    }

    pub(crate) async fn upsert_with(
        &self,
        collection: &Collection,
        skip_thumbnail: bool,
    ) -> Result<()> {
        if collection.deleted {
            return self.remove_collection(&collection.id).await;
        }

        let mut summary = CollectionSummary::project(collection);
        if !skip_thumbnail {
            summary.thumbnail_data_url = self.inline_thumbnail(collection).await?;
        }

        // A library or type change strands entries in the old secondary
        // sets; clear them first using the previous summary.
        if let Some(old) = self.read_summary(&collection.id).await?
            && (old.library_id != summary.library_id || old.kind != summary.kind)
        {
            self.remove_from_sorted_sets(&old).await?;
        }

        let member = collection.id.to_string();
        let mut sorted_entries = Vec::with_capacity(30);
        for field in SortField::ALL {
            let value = field.value_of(&summary);
            for dir in SortDirection::ALL {
                let score = dir.score(value);
                sorted_entries.push((self.keys.sorted(field, dir), member.clone(), score));
                sorted_entries.push((
                    self.keys.sorted_by_library(&summary.library_id, field, dir),
                    member.clone(),
                    score,
                ));
                sorted_entries.push((
                    self.keys.sorted_by_type(summary.kind, field, dir),
                    member.clone(),
                    score,
                ));
            }
        }
        self.store.zadd_multi(&sorted_entries).await?;

        let state =
            CollectionIndexState::capture(collection, summary.thumbnail_data_url.is_some());
        self.store
            .mset(&[
                (self.keys.data(&collection.id), serde_json::to_vec(&summary)?),
                (self.keys.state(&collection.id), serde_json::to_vec(&state)?),
            ])
            .await?;
        self.refresh_total().await?;
        debug!(collection = %collection.id, "index projection written");
        Ok(())
    }

    /// Removes a collection from every index key except its cached
    /// thumbnail bytes, which are left to their TTL.
    pub async fn remove_collection(&self, id: &CollectionId) -> Result<()> {
        if let Some(old) = self.read_summary(id).await? {
            self.remove_from_sorted_sets(&old).await?;
        } else {
            // No summary to consult: clear the primary sets at least.
            let member = id.to_string();
            let mut entries = Vec::with_capacity(10);
            for field in SortField::ALL {
                for dir in SortDirection::ALL {
                    entries.push((self.keys.sorted(field, dir), member.clone()));
                }
            }
            self.store.zrem_multi(&entries).await?;
        }
        self.store
            .del(&[self.keys.data(id), self.keys.state(id)])
            .await?;
        self.refresh_total().await?;
        Ok(())
    }

    async fn remove_from_sorted_sets(&self, summary: &CollectionSummary) -> Result<()> {
        let member = summary.id.to_string();
        let entries: Vec<(String, String)> = self
            .keys
            .sorted_keys_for(summary)
            .into_iter()
            .map(|key| (key, member.clone()))
            .collect();
        self.store.zrem_multi(&entries).await
    }

    async fn refresh_total(&self) -> Result<()> {
        let total = self
            .store
            .zcard(&self.keys.sorted(SortField::UpdatedAt, SortDirection::Asc))
            .await?;
        self.store
            .mset(&[(self.keys.stats_total(), total.to_string().into_bytes())])
            .await
    }

    pub(crate) async fn read_summary(&self, id: &CollectionId) -> Result<Option<CollectionSummary>> {
        let Some(bytes) = self.store.get(&self.keys.data(id)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(summary) => Ok(Some(summary)),
            Err(e) => {
                warn!(collection = %id, error = %e, "corrupt summary blob ignored");
                Ok(None)
            }
        }
    }

    pub(crate) async fn read_state(&self, id: &CollectionId) -> Result<Option<CollectionIndexState>> {
        let Some(bytes) = self.store.get(&self.keys.state(id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    fn sorted_key(&self, field: SortField, dir: SortDirection, filter: Option<&ListFilter>) -> String {
        match filter {
            None => self.keys.sorted(field, dir),
            Some(ListFilter::Library(library_id)) => {
                self.keys.sorted_by_library(library_id, field, dir)
            }
            Some(ListFilter::Type(kind)) => self.keys.sorted_by_type(*kind, field, dir),
        }
    }

    /// `GetPage`: one ZRANGE for the ids, one MGET for the summaries.
    pub async fn get_page(
        &self,
        field: SortField,
        dir: SortDirection,
        page: u64,
        page_size: u64,
        filter: Option<&ListFilter>,
    ) -> Result<PageResult> {
        if page == 0 || page_size == 0 {
            return Err(ImagoError::Validation(
                "page and pageSize are 1-based and non-zero".into(),
            ));
        }
        let key = self.sorted_key(field, dir, filter);
        let total = self.store.zcard(&key).await?;
        let start = ((page - 1) * page_size) as i64;
        let stop = start + page_size as i64 - 1;
        let ids = self.store.zrange(&key, start, stop).await?;
        let items = self.fetch_summaries(&ids).await?;
        let total_pages = total.div_ceil(page_size);
        Ok(PageResult {
            items,
            page: page as i64,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        })
    }

    /// `GetPosition` + `GetNeighbors` in one call: rank, total, and the
    /// adjacent members, all from ascending reads.
    pub async fn get_position(
        &self,
        id: &CollectionId,
        field: SortField,
        dir: SortDirection,
        filter: Option<&ListFilter>,
    ) -> Result<PositionResult> {
        let key = self.sorted_key(field, dir, filter);
        let member = id.to_string();
        let rank = self
            .store
            .zrank(&key, &member)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id} not indexed")))?;
        let total = self.store.zcard(&key).await?;
        let prev_id = if rank > 0 {
            self.store
                .zrange(&key, rank as i64 - 1, rank as i64 - 1)
                .await?
                .first()
                .and_then(|s| s.parse().ok())
        } else {
            None
        };
        let next_id = if rank + 1 < total {
            self.store
                .zrange(&key, rank as i64 + 1, rank as i64 + 1)
                .await?
                .first()
                .and_then(|s| s.parse().ok())
        } else {
            None
        };
        Ok(PositionResult {
            rank1_based: rank + 1,
            total,
            prev_id,
            next_id,
        })
    }

    pub async fn get_count(&self, filter: Option<&ListFilter>) -> Result<u64> {
        self.store
            .zcard(&self.sorted_key(SortField::UpdatedAt, SortDirection::Asc, filter))
            .await
    }

    /// Sidebar listing relative to the currently open collection: page 1
    /// is centered on it, later pages continue forward from its end, page
    /// 0 and below continue backward from its start.
    pub async fn get_sidebar_page(
        &self,
        id: &CollectionId,
        field: SortField,
        dir: SortDirection,
        page: i64,
        page_size: u64,
    ) -> Result<PageResult> {
        if page_size == 0 {
            return Err(ImagoError::Validation("pageSize must be non-zero".into()));
        }
        let key = self.sorted_key(field, dir, None);
        let member = id.to_string();
        let position = self
            .store
            .zrank(&key, &member)
            .await?
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id} not indexed")))?
            as i64;
        let total = self.store.zcard(&key).await? as i64;
        let page_size_i = page_size as i64;
        let half = page_size_i / 2;

        // Page 1's centered window, clamped with deficit extension.
        let mut centered_start = position - half;
        let mut centered_end = position + half;
        if centered_start < 0 {
            centered_end += -centered_start;
            centered_start = 0;
        }
        if centered_end > total - 1 {
            let overflow = centered_end - (total - 1);
            centered_start = (centered_start - overflow).max(0);
            centered_end = total - 1;
        }

        let (start, stop) = if page == 1 {
            (centered_start, centered_end)
        } else if page >= 2 {
            let start = centered_end + 1 + (page - 2) * page_size_i;
            (start, (start + page_size_i - 1).min(total - 1))
        } else {
            // page ≤ 0 walks backward from the centered window.
            let back_pages = 1 - page;
            let stop = centered_start - 1 - (back_pages - 1) * page_size_i;
            ((stop - page_size_i + 1).max(0), stop)
        };

        let items = if start > total - 1 || stop < 0 || start > stop {
            Vec::new()
        } else {
            let ids = self.store.zrange(&key, start, stop).await?;
            self.fetch_summaries(&ids).await?
        };

        let total_pages = (total as u64).div_ceil(page_size);
        Ok(PageResult {
            has_next: stop < total - 1,
            has_prev: start > 0,
            items,
            page,
            total: total as u64,
            total_pages,
        })
    }

    async fn fetch_summaries(&self, ids: &[String]) -> Result<Vec<CollectionSummary>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .filter_map(|id| id.parse::<CollectionId>().ok())
            .map(|id| self.keys.data(&id))
            .collect();
        let blobs = self.store.mget(&keys).await?;
        let mut summaries = Vec::with_capacity(blobs.len());
        for (key, blob) in keys.iter().zip(blobs) {
            match blob {
                Some(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => warn!(key, error = %e, "corrupt summary blob skipped"),
                },
                None => warn!(key, "summary missing for indexed collection"),
            }
        }
        Ok(summaries)
    }

    /// Builds the base64 data-URL for a collection's first thumbnail, when
    /// it is small enough to inline. Direct references are resized in
    /// memory instead of inlining the full-resolution original.
    async fn inline_thumbnail(&self, collection: &Collection) -> Result<Option<String>> {
        let Some(first) = collection.first_image() else {
            return Ok(None);
        };
        let Some(entry) = collection.thumbnail_for(&first.id) else {
            return Ok(None);
        };
        let thumb_key = self.keys.thumb(&collection.id);

        if entry.is_direct {
            let path = entry.path.clone();
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "direct thumbnail unreadable");
                    return Ok(None);
                }
            };
            let rendered = tokio::task::spawn_blocking(move || {
                media::render_jpeg(&bytes, DIRECT_INLINE_DIM, DIRECT_INLINE_DIM, DIRECT_INLINE_QUALITY)
            })
            .await
            .map_err(|e| ImagoError::Internal(format!("resize task panicked: {e}")))?;
            let rendered = match rendered {
                Ok(rendered) => rendered,
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "direct thumbnail undecodable");
                    return Ok(None);
                }
            };
            self.store
                .set_with_ttl(&thumb_key, rendered.bytes.clone(), self.thumb_ttl)
                .await?;
            return Ok(Some(media::data_url(ImageFormatTag::Jpeg, &rendered.bytes)));
        }

        if entry.byte_size > INLINE_MAX_BYTES
            || entry.width > INLINE_MAX_DIM
            || entry.height > INLINE_MAX_DIM
        {
            return Ok(None);
        }
        let bytes = match self.store.get(&thumb_key).await? {
            Some(bytes) => bytes,
            None => match tokio::fs::read(&entry.path).await {
                Ok(bytes) => {
                    self.store
                        .set_with_ttl(&thumb_key, bytes.clone(), self.thumb_ttl)
                        .await?;
                    bytes
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "thumbnail file unreadable");
                    return Ok(None);
                }
            },
        };
        Ok(Some(media::data_url(entry.format, &bytes)))
    }
}
