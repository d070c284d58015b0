//! Index rebuild strategies and the periodic reconciler.
//!
//! All modes work in batches so the working set stays bounded, check the
//! cancellation token and the optional deadline between batches, and
//! return whatever statistics were gathered when aborted early.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use imago_model::Collection;

use crate::error::Result;
use crate::index::IndexService;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebuildMode {
    /// Delete every index key (thumbnail bytes excepted), then re-add all
    /// live collections.
    Full,
    /// Overwrite in place without the pattern-scan delete.
    ForceRebuildAll,
    /// Rebuild only collections whose aggregate moved past their recorded
    /// index state.
    ChangedOnly,
    /// Three-phase reconciliation: rebuild missing/stale, remove orphaned
    /// index entries, apply. Supports dry-run.
    Verify,
}

#[derive(Clone, Copy, Debug)]
pub struct RebuildOptions {
    pub mode: RebuildMode,
    pub dry_run: bool,
    /// Skip base64 thumbnail inlining for a large speedup at the cost of
    /// first-request latency.
    pub skip_thumbnails: bool,
    pub timeout: Option<Duration>,
}

impl RebuildOptions {
    pub fn new(mode: RebuildMode) -> Self {
        Self {
            mode,
            dry_run: false,
            skip_thumbnails: false,
            timeout: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub scanned: u64,
    pub rebuilt: u64,
    pub skipped: u64,
    pub orphans_removed: u64,
    pub dry_run: bool,
    pub aborted: bool,
    pub duration_ms: u64,
    /// Verify only: ids missing from the index entirely.
    pub missing: Vec<String>,
    /// Verify only: ids whose aggregate advanced past the index state.
    pub stale: Vec<String>,
    /// Verify only: index states whose collection is gone or deleted.
    pub orphaned: Vec<String>,
}

struct RebuildGuard<'a> {
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
}

impl RebuildGuard<'_> {
    fn should_abort(&self) -> bool {
        self.cancel.is_cancelled()
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

impl IndexService {
    /// Runs one rebuild pass. Aborts cleanly at the next batch boundary on
    /// cancellation or timeout and returns partial statistics.
    pub async fn rebuild(
        &self,
        options: RebuildOptions,
        cancel: &CancellationToken,
    ) -> Result<RebuildReport> {
        let started = Instant::now();
        let guard = RebuildGuard {
            cancel,
            deadline: options.timeout.map(|t| started + t),
        };
        let mut report = RebuildReport {
            dry_run: options.dry_run,
            ..RebuildReport::default()
        };

        let all = self.collections().list_all().await?;
        let live: Vec<Collection> = all.iter().filter(|c| !c.deleted).cloned().collect();
        info!(
            mode = ?options.mode,
            collections = live.len(),
            dry_run = options.dry_run,
            "index rebuild started"
        );

        match options.mode {
            RebuildMode::Full => {
                if !options.dry_run {
                    self.delete_index_keys().await?;
                }
                self.rebuild_collections(&live, &options, &guard, &mut report)
                    .await?;
            }
            RebuildMode::ForceRebuildAll => {
                self.rebuild_collections(&live, &options, &guard, &mut report)
                    .await?;
            }
            RebuildMode::ChangedOnly => {
                let mut to_rebuild = Vec::new();
                for collection in &live {
                    if self.needs_rebuild(collection).await? {
                        to_rebuild.push(collection.clone());
                    } else {
                        report.skipped += 1;
                    }
                }
                self.rebuild_collections(&to_rebuild, &options, &guard, &mut report)
                    .await?;
                report.scanned += report.skipped;
            }
            RebuildMode::Verify => {
                self.verify(&all, &live, &options, &guard, &mut report).await?;
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        if !options.dry_run && !report.aborted {
            self.store()
                .mset(&[(
                    self.keys().last_rebuild(),
                    Utc::now().timestamp().to_string().into_bytes(),
                )])
                .await?;
        }
        info!(
            rebuilt = report.rebuilt,
            skipped = report.skipped,
            orphans = report.orphans_removed,
            aborted = report.aborted,
            elapsed_ms = report.duration_ms,
            "index rebuild finished"
        );
        Ok(report)
    }

    /// Deletes every index key except the cached thumbnail bytes, in
    /// batches.
    async fn delete_index_keys(&self) -> Result<()> {
        let thumb_prefix = self.keys().thumb_prefix();
        let keys: Vec<String> = self
            .store()
            .scan_keys(&self.keys().all_pattern())
            .await?
            .into_iter()
            .filter(|key| !key.starts_with(&thumb_prefix))
            .collect();
        debug!(count = keys.len(), "deleting index keys");
        for chunk in keys.chunks(500) {
            self.store().del(chunk).await?;
        }
        Ok(())
    }

    async fn needs_rebuild(&self, collection: &Collection) -> Result<bool> {
        match self.read_state(&collection.id).await? {
            None => Ok(true),
            Some(state) => Ok(state.is_stale_for(collection)),
        }
    }

    async fn rebuild_collections(
        &self,
        collections: &[Collection],
        options: &RebuildOptions,
        guard: &RebuildGuard<'_>,
        report: &mut RebuildReport,
    ) -> Result<()> {
        for batch in collections.chunks(self.rebuild_batch_size()) {
            if guard.should_abort() {
                report.aborted = true;
                warn!("rebuild aborted at batch boundary");
                return Ok(());
            }
            for collection in batch {
                report.scanned += 1;
                if options.dry_run {
                    report.rebuilt += 1;
                    continue;
                }
                match self.upsert_with(collection, options.skip_thumbnails).await {
                    Ok(()) => report.rebuilt += 1,
                    Err(e) => {
                        warn!(collection = %collection.id, error = %e, "rebuild of one collection failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn verify(
        &self,
        all: &[Collection],
        live: &[Collection],
        options: &RebuildOptions,
        guard: &RebuildGuard<'_>,
        report: &mut RebuildReport,
    ) -> Result<()> {
        // Phase 1: collections missing from or stale in the index.
        let mut to_rebuild = Vec::new();
        for collection in live {
            report.scanned += 1;
            match self.read_state(&collection.id).await? {
                None => {
                    report.missing.push(collection.id.to_string());
                    to_rebuild.push(collection.clone());
                }
                Some(state) if state.is_stale_for(collection) => {
                    report.stale.push(collection.id.to_string());
                    to_rebuild.push(collection.clone());
                }
                Some(_) => report.skipped += 1,
            }
        }

        // Phase 2: index states whose collection is gone or soft-deleted.
        let mut orphaned = Vec::new();
        for key in self.store().scan_keys(&self.keys().state_pattern()).await? {
            let Some(id) = self.keys().state_key_to_id(&key) else {
                warn!(key, "unparseable index state key");
                continue;
            };
            let alive = all.iter().any(|c| c.id == id && !c.deleted);
            if !alive {
                report.orphaned.push(id.to_string());
                orphaned.push(id);
            }
        }

        // Phase 3: apply, unless this is a dry run.
        if options.dry_run {
            return Ok(());
        }
        let surveyed = report.scanned;
        self.rebuild_collections(&to_rebuild, options, guard, report)
            .await?;
        report.scanned = surveyed;
        if report.aborted {
            return Ok(());
        }
        for id in orphaned {
            if guard.should_abort() {
                report.aborted = true;
                return Ok(());
            }
            self.remove_collection(&id).await?;
            report.orphans_removed += 1;
        }
        Ok(())
    }
}

/// Periodic index ↔ document-store reconciliation: a thumbnail-less
/// Verify pass on a timer.
pub struct IndexReconciler {
    service: Arc<IndexService>,
    interval: Duration,
}

impl std::fmt::Debug for IndexReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexReconciler")
            .field("interval", &self.interval)
            .finish()
    }
}

impl IndexReconciler {
    pub fn new(service: Arc<IndexService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would race boot-time scans.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let options = RebuildOptions {
                    skip_thumbnails: true,
                    ..RebuildOptions::new(RebuildMode::Verify)
                };
                match self.service.rebuild(options, &cancel).await {
                    Ok(report) if report.rebuilt > 0 || report.orphans_removed > 0 => {
                        info!(
                            rebuilt = report.rebuilt,
                            orphans = report.orphans_removed,
                            "reconciler repaired index drift"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "reconciler pass failed"),
                }
            }
            debug!("index reconciler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagoConfig;
    use crate::index::MemoryIndexStore;
    use crate::store::{CollectionRepository, MemoryStore};
    use imago_model::{Collection, CollectionSettings, CollectionType, LibraryId, SortDirection, SortField};

    async fn fixture(n: usize) -> (Arc<MemoryStore>, Arc<IndexService>, Vec<Collection>) {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(IndexService::new(
            Arc::new(MemoryIndexStore::new()),
            store.clone(),
            &ImagoConfig::default(),
        ));
        let library = LibraryId::generate();
        let mut collections = Vec::new();
        for i in 0..n {
            let collection = Collection::new(
                format!("c{i}"),
                format!("/lib/c{i}"),
                CollectionType::Folder,
                library,
                CollectionSettings::default(),
            );
            CollectionRepository::create(&*store, collection.clone())
                .await
                .unwrap();
            collections.push(collection);
        }
        (store, service, collections)
    }

    #[tokio::test]
    async fn full_rebuild_indexes_every_live_collection() {
        let (_store, service, _) = fixture(7).await;
        let report = service
            .rebuild(
                RebuildOptions {
                    skip_thumbnails: true,
                    ..RebuildOptions::new(RebuildMode::Full)
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.rebuilt, 7);
        assert!(!report.aborted);
        assert_eq!(service.get_count(None).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn changed_only_skips_fresh_collections() {
        let (store, service, mut collections) = fixture(3).await;
        for collection in &collections {
            service.upsert_collection(collection).await.unwrap();
        }

        // Touch one aggregate so its index state goes stale.
        store
            .clear_image_arrays(&collections[1].id)
            .await
            .unwrap();
        collections[1] = CollectionRepository::get(&*store, &collections[1].id)
            .await
            .unwrap()
            .unwrap();

        let report = service
            .rebuild(
                RebuildOptions {
                    skip_thumbnails: true,
                    ..RebuildOptions::new(RebuildMode::ChangedOnly)
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.rebuilt, 1);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn verify_dry_run_reports_without_mutating() {
        let (store, service, collections) = fixture(3).await;
        // Index only the first two; delete the second from the store.
        service.upsert_collection(&collections[0]).await.unwrap();
        service.upsert_collection(&collections[1]).await.unwrap();
        store.soft_delete(&collections[1].id).await.unwrap();

        let report = service
            .rebuild(
                RebuildOptions {
                    dry_run: true,
                    skip_thumbnails: true,
                    ..RebuildOptions::new(RebuildMode::Verify)
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.missing, vec![collections[2].id.to_string()]);
        assert_eq!(report.orphaned, vec![collections[1].id.to_string()]);
        assert_eq!(report.orphans_removed, 0, "dry run must not mutate");
        // The orphan is still indexed.
        assert!(service.read_summary(&collections[1].id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn verify_repairs_missing_and_orphaned_entries() {
        let (store, service, collections) = fixture(3).await;
        service.upsert_collection(&collections[0]).await.unwrap();
        service.upsert_collection(&collections[1]).await.unwrap();
        store.soft_delete(&collections[1].id).await.unwrap();

        let report = service
            .rebuild(
                RebuildOptions {
                    skip_thumbnails: true,
                    ..RebuildOptions::new(RebuildMode::Verify)
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(report.rebuilt >= 1);

        // Every live collection indexed; every index entry live.
        assert_eq!(service.get_count(None).await.unwrap(), 2);
        assert!(service.read_summary(&collections[1].id).await.unwrap().is_none());
        assert!(service.read_summary(&collections[2].id).await.unwrap().is_some());
        let position = service
            .get_position(&collections[2].id, SortField::Name, SortDirection::Asc, None)
            .await
            .unwrap();
        assert_eq!(position.total, 2);
    }

    #[tokio::test]
    async fn cancelled_rebuild_aborts_with_partial_stats() {
        let (_store, service, _) = fixture(5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = service
            .rebuild(
                RebuildOptions {
                    skip_thumbnails: true,
                    ..RebuildOptions::new(RebuildMode::Full)
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(report.aborted);
        assert_eq!(report.rebuilt, 0);
    }
}
