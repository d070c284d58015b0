//! Bundled single-node document store.
//!
//! Each repository method runs under one critical section per aggregate,
//! which is how the "single atomic compound update" contract of the ports
//! is honored in process. Collections sit behind one `RwLock` because
//! create must check path uniqueness; jobs and cache folders use per-entry
//! `DashMap` access so stage increments from many workers never contend on
//! a global lock.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::debug;

use imago_model::{
    BackgroundJob, CacheFolder, CacheFolderId, CacheImageEmbedded, Collection, CollectionId,
    CollectionSettings, CollectionType, ImageEmbedded, ImageFormatTag, ImageId, JobId, JobStatus,
    LibraryId, StageStatus, ThumbnailEmbedded,
};

use crate::error::{ImagoError, Result};
use crate::store::{CacheFolderRepository, CollectionRepository, JobRepository};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<CollectionId, Collection>>,
    jobs: DashMap<JobId, BackgroundJob>,
    cache_folders: DashMap<CacheFolderId, CacheFolder>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CollectionRepository for MemoryStore {
    async fn create(&self, collection: Collection) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collision = collections
            .values()
            .any(|existing| !existing.deleted && existing.path == collection.path);
        if collision {
            return Err(ImagoError::Conflict(format!(
                "collection already exists at {}",
                collection.path.display()
            )));
        }
        debug!(id = %collection.id, path = %collection.path.display(), "collection created");
        collections.insert(collection.id, collection);
        Ok(())
    }

    async fn get(&self, id: &CollectionId) -> Result<Option<Collection>> {
        Ok(self.collections.read().await.get(id).cloned())
    }

    async fn find_by_path(&self, path: &Path) -> Result<Option<Collection>> {
        Ok(self
            .collections
            .read()
            .await
            .values()
            .find(|c| !c.deleted && c.path == path)
            .cloned())
    }

    async fn find_by_library(&self, library_id: &LibraryId) -> Result<Vec<Collection>> {
        Ok(self
            .collections
            .read()
            .await
            .values()
            .filter(|c| !c.deleted && c.library_id == *library_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Collection>> {
        Ok(self.collections.read().await.values().cloned().collect())
    }

    async fn add_image_if_absent(&self, id: &CollectionId, image: ImageEmbedded) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        if collection.has_image_entry(&image.filename, &image.relative_path) {
            return Ok(false);
        }
        collection.statistics.total_items += 1;
        collection.statistics.total_size += image.byte_size;
        collection.images.push(image);
        collection.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_image_dimensions(
        &self,
        id: &CollectionId,
        image_id: &ImageId,
        width: u32,
        height: u32,
        format: ImageFormatTag,
    ) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        let image = collection
            .images
            .iter_mut()
            .find(|img| img.id == *image_id)
            .ok_or_else(|| ImagoError::NotFound(format!("image {image_id} in collection {id}")))?;
        image.width = width;
        image.height = height;
        image.format = format;
        collection.updated_at = Utc::now();
        Ok(())
    }

    async fn add_thumbnails(
        &self,
        id: &CollectionId,
        entries: Vec<ThumbnailEmbedded>,
    ) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        let mut added = 0u64;
        for entry in entries {
            if collection.image(&entry.image_id).is_none() {
                return Err(ImagoError::Validation(format!(
                    "thumbnail references unknown image {}",
                    entry.image_id
                )));
            }
            let duplicate = collection.thumbnails.iter().any(|t| {
                t.image_id == entry.image_id && t.width == entry.width && t.height == entry.height
            });
            if !duplicate {
                collection.thumbnails.push(entry);
                added += 1;
            }
        }
        if added > 0 {
            collection.updated_at = Utc::now();
        }
        Ok(added)
    }

    async fn add_cache_images(
        &self,
        id: &CollectionId,
        entries: Vec<CacheImageEmbedded>,
    ) -> Result<u64> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        let mut added = 0u64;
        for entry in entries {
            if collection.image(&entry.image_id).is_none() {
                return Err(ImagoError::Validation(format!(
                    "cache image references unknown image {}",
                    entry.image_id
                )));
            }
            if collection.cache_image_for(&entry.image_id).is_none() {
                collection.cache_images.push(entry);
                added += 1;
            }
        }
        if added > 0 {
            collection.updated_at = Utc::now();
        }
        Ok(added)
    }

    async fn clear_image_arrays(&self, id: &CollectionId) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        collection.images.clear();
        collection.thumbnails.clear();
        collection.cache_images.clear();
        collection.statistics = Default::default();
        collection.updated_at = Utc::now();
        Ok(())
    }

    async fn update_settings(&self, id: &CollectionId, settings: CollectionSettings) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        let mut settings = settings;
        if collection.kind == CollectionType::Archive {
            settings.use_direct_file_access = false;
        }
        collection.settings = settings;
        collection.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete(&self, id: &CollectionId) -> Result<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(id)
            .ok_or_else(|| ImagoError::NotFound(format!("collection {id}")))?;
        collection.deleted = true;
        collection.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, job: BackgroundJob) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(ImagoError::Conflict(format!("job {} already exists", job.id)));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<BackgroundJob>> {
        Ok(self.jobs.get(id).map(|entry| entry.clone()))
    }

    async fn list_active(&self) -> Result<Vec<BackgroundJob>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.clone())
            .collect())
    }

    async fn increment_stage(&self, id: &JobId, stage: &str, by: u64) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        let now = Utc::now();
        // $inc on a missing path: silently lost by contract.
        if let Some(stage) = job.stages.get_mut(stage) {
            stage.completed_items += by;
            if stage.status == StageStatus::Pending {
                stage.status = StageStatus::InProgress;
                stage.started_at = Some(now);
            }
        }
        if job.status == JobStatus::Pending {
            job.status = JobStatus::InProgress;
            job.started_at = Some(now);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn set_stage_total(&self, id: &JobId, stage: &str, total_items: u64) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        if let Some(stage) = job.stages.get_mut(stage) {
            stage.total_items = total_items;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn adjust_stage_total(&self, id: &JobId, stage: &str, delta: i64) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        if let Some(stage) = job.stages.get_mut(stage) {
            stage.total_items = stage.total_items.saturating_add_signed(delta);
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn set_stage_status(
        &self,
        id: &JobId,
        stage_name: &str,
        status: StageStatus,
        message: Option<String>,
    ) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        let now = Utc::now();
        if let Some(stage) = job.stages.get_mut(stage_name) {
            stage.status = status;
            match status {
                StageStatus::Completed => stage.completed_at = Some(now),
                StageStatus::Failed => stage.error_message = message.clone(),
                StageStatus::InProgress if stage.started_at.is_none() => {
                    stage.started_at = Some(now);
                }
                _ => {}
            }
            if message.is_some() && status != StageStatus::Failed {
                stage.message = message;
            }
        }
        job.updated_at = now;
        Ok(())
    }

    async fn close_stage(&self, id: &JobId, stage_name: &str, completed_items: u64) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        let now = Utc::now();
        if let Some(stage) = job.stages.get_mut(stage_name) {
            stage.completed_items = completed_items;
            stage.status = StageStatus::Completed;
            stage.completed_at = Some(now);
            if stage.started_at.is_none() {
                stage.started_at = Some(now);
            }
        }
        job.updated_at = now;
        Ok(())
    }

    async fn set_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        let now = Utc::now();
        job.status = status;
        if message.is_some() {
            job.message = message;
        }
        if status.is_terminal() && job.completed_at.is_none() {
            job.completed_at = Some(now);
        }
        job.updated_at = now;
        Ok(())
    }

    async fn complete_job(&self, id: &JobId) -> Result<()> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("job {id}")));
        };
        let now = Utc::now();
        job.total_items = job.stages.values().map(|s| s.total_items).sum();
        job.completed_items = job.stages.values().map(|s| s.completed_items).sum();
        job.progress_percent = 100;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl CacheFolderRepository for MemoryStore {
    async fn insert(&self, folder: CacheFolder) -> Result<()> {
        self.cache_folders.insert(folder.id, folder);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CacheFolder>> {
        Ok(self
            .cache_folders
            .iter()
            .map(|entry| entry.clone())
            .collect())
    }

    async fn find_active_lowest_priority(
        &self,
        estimated_bytes: u64,
    ) -> Result<Option<CacheFolder>> {
        Ok(self
            .cache_folders
            .iter()
            .filter(|f| f.enabled && f.has_capacity_for(estimated_bytes))
            .min_by_key(|f| (f.priority, f.id))
            .map(|entry| entry.clone()))
    }

    async fn increment_stats(
        &self,
        id: &CacheFolderId,
        size_delta: i64,
        file_delta: i64,
        collection_id: &CollectionId,
    ) -> Result<()> {
        let Some(mut folder) = self.cache_folders.get_mut(id) else {
            return Err(ImagoError::NotFound(format!("cache folder {id}")));
        };
        folder.current_size_bytes = folder.current_size_bytes.saturating_add_signed(size_delta);
        folder.total_files = folder.total_files.saturating_add_signed(file_delta);
        if folder.cached_collection_ids.insert(*collection_id) {
            folder.total_collections += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imago_model::{JobKind, STAGE_SCAN, STAGE_THUMBNAIL};
    use uuid::Uuid;

    fn image(name: &str) -> ImageEmbedded {
        ImageEmbedded {
            id: ImageId::generate(),
            filename: name.to_string(),
            relative_path: name.to_string(),
            byte_size: 128,
            width: 0,
            height: 0,
            format: ImageFormatTag::Jpeg,
        }
    }

    fn collection() -> Collection {
        Collection::new(
            "CollA",
            "/lib/a/CollA",
            CollectionType::Folder,
            LibraryId::generate(),
            CollectionSettings::default(),
        )
    }

    #[tokio::test]
    async fn add_image_is_idempotent_on_filename_and_path() {
        let store = MemoryStore::new();
        let coll = collection();
        let id = coll.id;
        CollectionRepository::create(&store, coll).await.unwrap();

        assert!(store.add_image_if_absent(&id, image("1.jpg")).await.unwrap());
        assert!(!store.add_image_if_absent(&id, image("1.jpg")).await.unwrap());

        let stored = CollectionRepository::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(stored.images.len(), 1);
        assert_eq!(stored.statistics.total_items, 1);
        assert_eq!(stored.statistics.total_size, 128);
    }

    #[tokio::test]
    async fn duplicate_filenames_in_subfolders_both_land() {
        let store = MemoryStore::new();
        let coll = collection();
        let id = coll.id;
        CollectionRepository::create(&store, coll).await.unwrap();

        let mut nested = image("1.jpg");
        nested.relative_path = "sub/1.jpg".into();
        assert!(store.add_image_if_absent(&id, image("1.jpg")).await.unwrap());
        assert!(store.add_image_if_absent(&id, nested).await.unwrap());

        let stored = CollectionRepository::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(stored.images.len(), 2);
    }

    #[tokio::test]
    async fn path_collision_is_a_conflict() {
        let store = MemoryStore::new();
        CollectionRepository::create(&store, collection()).await.unwrap();
        let err = CollectionRepository::create(&store, collection()).await.unwrap_err();
        assert!(matches!(err, ImagoError::Conflict(_)));
    }

    #[tokio::test]
    async fn thumbnails_dedupe_on_image_and_box() {
        let store = MemoryStore::new();
        let coll = collection();
        let id = coll.id;
        CollectionRepository::create(&store, coll).await.unwrap();
        let img = image("1.jpg");
        let img_id = img.id;
        store.add_image_if_absent(&id, img).await.unwrap();

        let thumb = ThumbnailEmbedded {
            image_id: img_id,
            path: "/cache/t.jpg".into(),
            width: 300,
            height: 200,
            byte_size: 9,
            format: ImageFormatTag::Jpeg,
            is_direct: false,
        };
        assert_eq!(
            store.add_thumbnails(&id, vec![thumb.clone(), thumb.clone()]).await.unwrap(),
            1
        );
        assert_eq!(store.add_thumbnails(&id, vec![thumb]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn thumbnail_for_unknown_image_is_rejected() {
        let store = MemoryStore::new();
        let coll = collection();
        let id = coll.id;
        CollectionRepository::create(&store, coll).await.unwrap();

        let orphan = ThumbnailEmbedded {
            image_id: ImageId::generate(),
            path: "/cache/t.jpg".into(),
            width: 300,
            height: 200,
            byte_size: 9,
            format: ImageFormatTag::Jpeg,
            is_direct: false,
        };
        let err = store.add_thumbnails(&id, vec![orphan]).await.unwrap_err();
        assert!(matches!(err, ImagoError::Validation(_)));
    }

    #[tokio::test]
    async fn stage_increment_against_missing_stage_is_lost() {
        let store = MemoryStore::new();
        let job = BackgroundJob::new(JobKind::CollectionScan, Uuid::new_v4())
            .with_stage(STAGE_SCAN, 5);
        let id = job.id;
        JobRepository::create(&store, job).await.unwrap();

        store.increment_stage(&id, STAGE_SCAN, 2).await.unwrap();
        store.increment_stage(&id, STAGE_THUMBNAIL, 2).await.unwrap();

        let job = JobRepository::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(job.stage(STAGE_SCAN).unwrap().completed_items, 2);
        assert!(job.stage(STAGE_THUMBNAIL).is_none());
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn complete_job_rolls_up_stage_counters() {
        let store = MemoryStore::new();
        let job = BackgroundJob::new(JobKind::CollectionScan, Uuid::new_v4())
            .with_stage(STAGE_SCAN, 2)
            .with_stage(STAGE_THUMBNAIL, 2);
        let id = job.id;
        JobRepository::create(&store, job).await.unwrap();
        store.increment_stage(&id, STAGE_SCAN, 2).await.unwrap();
        store.increment_stage(&id, STAGE_THUMBNAIL, 2).await.unwrap();
        store.complete_job(&id).await.unwrap();

        let job = JobRepository::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_items, 4);
        assert_eq!(job.completed_items, 4);
        assert_eq!(job.progress_percent, 100);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn lowest_priority_folder_with_capacity_wins() {
        let store = MemoryStore::new();
        let mut full = CacheFolder::new("/cache0", 0, 100);
        full.current_size_bytes = 99;
        let roomy = CacheFolder::new("/cache1", 1, 1_000_000);
        CacheFolderRepository::insert(&store, full).await.unwrap();
        CacheFolderRepository::insert(&store, roomy.clone()).await.unwrap();

        let picked = store.find_active_lowest_priority(500).await.unwrap().unwrap();
        assert_eq!(picked.id, roomy.id);
    }

    #[tokio::test]
    async fn folder_stats_update_is_compound() {
        let store = MemoryStore::new();
        let folder = CacheFolder::new("/cache0", 0, 1_000);
        let folder_id = folder.id;
        CacheFolderRepository::insert(&store, folder).await.unwrap();
        let coll_id = CollectionId::generate();

        store.increment_stats(&folder_id, 100, 1, &coll_id).await.unwrap();
        store.increment_stats(&folder_id, 50, 1, &coll_id).await.unwrap();

        let folders = CacheFolderRepository::list(&store).await.unwrap();
        let folder = &folders[0];
        assert_eq!(folder.current_size_bytes, 150);
        assert_eq!(folder.total_files, 2);
        assert_eq!(folder.total_collections, 1);
    }
}
