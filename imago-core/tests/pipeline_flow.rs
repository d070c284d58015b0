//! End-to-end pipeline scenarios against the bundled backends: a real
//! temp filesystem, real image bytes, and the actual stage consumers.

mod common;

use std::io::Write as _;

use common::{Harness, jpeg_bytes, write_jpeg, write_png};

use imago_core::broker::{DLQ_QUEUE, MessageBroker};
use imago_core::{DlqRecovery, LibraryScanRequest};
use imago_model::{
    CollectionType, JobStatus, LibraryId, SortDirection, SortField, STAGE_CACHE, STAGE_SCAN,
    STAGE_THUMBNAIL,
};

fn scan_request(harness: &Harness, library_id: LibraryId) -> LibraryScanRequest {
    LibraryScanRequest {
        library_id,
        library_path: harness.library_path(),
        include_subfolders: true,
        resume_incomplete: false,
        overwrite_existing: false,
        use_direct_file_access: false,
        auto_scan: true,
    }
}

#[tokio::test]
async fn small_folder_scan_produces_full_aggregate_and_index() {
    let harness = Harness::new().await;
    let coll_dir = harness.library_path().join("CollA");
    write_jpeg(&coll_dir.join("1.jpg"), 500, 300);
    write_png(&coll_dir.join("2.png"), 400, 400);

    let library_id = LibraryId::generate();
    let library_job = harness
        .orchestrator
        .trigger_library_scan(scan_request(&harness, library_id))
        .await
        .unwrap();
    harness.drive().await;

    // The per-collection job is still open until the monitor closes it.
    let active = harness.deps.jobs.list_active().await.unwrap();
    let collection_job = active
        .iter()
        .find(|job| job.collection_id.is_some())
        .expect("collection job exists")
        .clone();
    let scan = collection_job.stage(STAGE_SCAN).unwrap();
    let thumb = collection_job.stage(STAGE_THUMBNAIL).unwrap();
    let cache = collection_job.stage(STAGE_CACHE).unwrap();
    assert_eq!((scan.total_items, scan.completed_items), (2, 2));
    assert_eq!((thumb.total_items, thumb.completed_items), (2, 2));
    assert_eq!((cache.total_items, cache.completed_items), (2, 2));

    harness.monitor.tick().await.unwrap();

    let library_job = harness.deps.jobs.get(&library_job).await.unwrap().unwrap();
    assert_eq!(library_job.status, JobStatus::Completed);
    let collection_job = harness
        .deps
        .jobs
        .get(&collection_job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection_job.status, JobStatus::Completed);
    assert_eq!(collection_job.progress_percent, 100);

    let collection = harness
        .deps
        .collections
        .find_by_path(&coll_dir)
        .await
        .unwrap()
        .expect("collection created");
    assert_eq!(collection.name, "CollA");
    assert_eq!(collection.images.len(), 2);
    // Deterministic case-insensitive order and probed dimensions.
    assert_eq!(collection.images[0].filename, "1.jpg");
    assert_eq!(
        (collection.images[0].width, collection.images[0].height),
        (500, 300)
    );
    assert_eq!(
        (collection.images[1].width, collection.images[1].height),
        (400, 400)
    );
    assert_eq!(collection.thumbnails.len(), 2);
    assert_eq!(collection.cache_images.len(), 2);
    assert_eq!(collection.statistics.total_items, 2);
    assert!(collection.statistics.total_size > 0);
    for entry in &collection.thumbnails {
        assert!(!entry.is_direct);
        assert!(entry.path.exists(), "derivative file written");
        assert!(entry.width <= 300 && entry.height <= 300);
    }

    // Index: one summary, rank 1 of 1, inlined thumbnail data-URL.
    let position = harness
        .deps
        .index
        .get_position(&collection.id, SortField::UpdatedAt, SortDirection::Desc, None)
        .await
        .unwrap();
    assert_eq!((position.rank1_based, position.total), (1, 1));
    let page = harness
        .deps
        .index
        .get_page(SortField::UpdatedAt, SortDirection::Desc, 1, 20, None)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    let summary = &page.items[0];
    assert_eq!(summary.image_count, 2);
    assert!(!summary.incomplete);
    assert!(
        summary
            .thumbnail_data_url
            .as_deref()
            .is_some_and(|url| url.starts_with("data:image/jpeg;base64,")),
        "first thumbnail inlined"
    );
}

#[tokio::test]
async fn direct_mode_references_originals_and_writes_nothing() {
    let harness = Harness::new().await;
    let coll_dir = harness.library_path().join("CollA");
    write_jpeg(&coll_dir.join("1.jpg"), 500, 300);
    write_png(&coll_dir.join("2.png"), 400, 400);

    let mut request = scan_request(&harness, LibraryId::generate());
    request.use_direct_file_access = true;
    harness.orchestrator.trigger_library_scan(request).await.unwrap();
    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let collection = harness
        .deps
        .collections
        .find_by_path(&coll_dir)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection.images.len(), 2);
    assert_eq!(collection.thumbnails.len(), 2);
    assert_eq!(collection.cache_images.len(), 2);
    for entry in &collection.thumbnails {
        assert!(entry.is_direct);
        assert!(entry.path.starts_with(&coll_dir), "points at the original");
        assert!(entry.path.exists());
    }
    assert!(
        harness.cache_files().is_empty(),
        "no bytes under any cache root"
    );

    // Stages closed by the scan consumer, job closed by the monitor.
    let jobs = harness.deps.jobs.list_active().await.unwrap();
    assert!(jobs.iter().all(|j| j.collection_id.is_none()));

    // The summary still carries an in-memory resized data-URL.
    let summary = harness
        .deps
        .index
        .get_page(SortField::UpdatedAt, SortDirection::Desc, 1, 20, None)
        .await
        .unwrap()
        .items
        .remove(0);
    assert!(
        summary
            .thumbnail_data_url
            .as_deref()
            .is_some_and(|url| url.starts_with("data:image/jpeg;base64,"))
    );
    assert!(!summary.incomplete);
}

#[tokio::test]
async fn archive_scan_filters_unsupported_entries() {
    let harness = Harness::new().await;
    let zip_path = harness.library_path().join("pack.zip");
    {
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("a.jpg", options).unwrap();
        writer.write_all(&jpeg_bytes(320, 200)).unwrap();
        writer.start_file("b.jpg", options).unwrap();
        writer.write_all(&jpeg_bytes(200, 320)).unwrap();
        writer.start_file("c.txt", options).unwrap();
        writer.write_all(b"not an image").unwrap();
        writer.finish().unwrap();
    }

    // Direct mode must be ignored for archives.
    let mut request = scan_request(&harness, LibraryId::generate());
    request.use_direct_file_access = true;
    harness.orchestrator.trigger_library_scan(request).await.unwrap();
    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let collection = harness
        .deps
        .collections
        .find_by_path(&zip_path)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection.kind, CollectionType::Archive);
    assert_eq!(collection.images.len(), 2, "txt entry filtered out");
    assert_eq!(collection.thumbnails.len(), 2);
    assert_eq!(collection.cache_images.len(), 2);
    assert!(collection.thumbnails.iter().all(|t| !t.is_direct));
    // Dimensions were deferred to image-process and recomputed there.
    assert_eq!(
        (collection.images[0].width, collection.images[0].height),
        (320, 200)
    );
    assert!(!harness.cache_files().is_empty());
}

#[tokio::test]
async fn rescanning_an_unchanged_folder_is_idempotent() {
    let harness = Harness::new().await;
    let coll_dir = harness.library_path().join("CollA");
    write_jpeg(&coll_dir.join("1.jpg"), 500, 300);
    write_jpeg(&coll_dir.join("sub/1.jpg"), 300, 500);

    harness
        .orchestrator
        .trigger_library_scan(scan_request(&harness, LibraryId::generate()))
        .await
        .unwrap();
    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let collection = harness
        .deps
        .collections
        .find_by_path(&coll_dir)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection.images.len(), 2, "same filename, two subfolders");
    let baseline_thumbs: Vec<_> = collection.thumbnails.clone();
    let derivative_count = harness.cache_files().len();

    // Second scan over the same unchanged folder.
    harness
        .orchestrator
        .enqueue_collection_scan(&collection, false)
        .await
        .unwrap();
    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let rescanned = harness
        .deps
        .collections
        .get(&collection.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rescanned.images.len(), 2);
    assert_eq!(rescanned.thumbnails, baseline_thumbs, "no duplicates");
    assert_eq!(rescanned.cache_images.len(), 2);
    assert_eq!(rescanned.statistics.total_items, 2);
    assert_eq!(
        harness.cache_files().len(),
        derivative_count,
        "derivative pre-check skipped regeneration"
    );
}

#[tokio::test]
async fn resume_enqueues_only_missing_derivatives() {
    let harness = Harness::new().await;
    let coll_dir = harness.library_path().join("Big");
    for i in 0..10 {
        write_jpeg(&coll_dir.join(format!("{i:02}.jpg")), 120, 90);
    }

    // First pass builds the aggregate fully.
    let library_id = LibraryId::generate();
    harness
        .orchestrator
        .trigger_library_scan(scan_request(&harness, library_id))
        .await
        .unwrap();
    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let collection = harness
        .deps
        .collections
        .find_by_path(&coll_dir)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection.images.len(), 10);

    // Simulate a partial earlier run: 7 thumbnails, 0 cache images.
    harness
        .deps
        .collections
        .clear_image_arrays(&collection.id)
        .await
        .unwrap();
    harness
        .orchestrator
        .enqueue_collection_scan(&collection, false)
        .await
        .unwrap();
    harness
        .drive_queues(&["collection-scan", "image-process", "thumbnail-gen"])
        .await;
    // Drop the cache-gen backlog and three of the thumbnails.
    harness
        .deps
        .broker
        .take("cache-gen", 1000)
        .await
        .unwrap();
    let mut collection = harness
        .deps
        .collections
        .get(&collection.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection.thumbnails.len(), 10);
    assert_eq!(collection.cache_images.len(), 0);
    for dropped in collection.thumbnails.split_off(7) {
        std::fs::remove_file(&dropped.path).unwrap();
    }
    // Rebuild the aggregate to the 7-thumbnail state.
    harness
        .deps
        .collections
        .clear_image_arrays(&collection.id)
        .await
        .unwrap();
    for image in &collection.images {
        harness
            .deps
            .collections
            .add_image_if_absent(&collection.id, image.clone())
            .await
            .unwrap();
    }
    // Re-key thumbnails to the re-added images.
    let refreshed = harness
        .deps
        .collections
        .get(&collection.id)
        .await
        .unwrap()
        .unwrap();
    let kept: Vec<_> = collection
        .thumbnails
        .iter()
        .zip(refreshed.images.iter())
        .map(|(thumb, image)| imago_model::ThumbnailEmbedded {
            image_id: image.id,
            ..thumb.clone()
        })
        .collect();
    harness
        .deps
        .collections
        .add_thumbnails(&collection.id, kept)
        .await
        .unwrap();

    // Resume: only the 3 missing thumbnails and all 10 cache images.
    let mut request = scan_request(&harness, library_id);
    request.resume_incomplete = true;
    harness.orchestrator.trigger_library_scan(request).await.unwrap();
    harness.drive_queues(&["library-scan"]).await;

    assert_eq!(harness.deps.broker.depth("image-process").await.unwrap(), 0);
    assert_eq!(harness.deps.broker.depth("thumbnail-gen").await.unwrap(), 3);
    assert_eq!(harness.deps.broker.depth("cache-gen").await.unwrap(), 10);

    let resume_job = harness
        .deps
        .jobs
        .list_active()
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.collection_id == Some(collection.id) && job.stage(STAGE_SCAN).is_none())
        .expect("resume job seeded without a scan stage");
    assert_eq!(resume_job.stage(STAGE_THUMBNAIL).unwrap().total_items, 3);
    assert_eq!(resume_job.stage(STAGE_CACHE).unwrap().total_items, 10);

    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let final_state = harness
        .deps
        .collections
        .get(&collection.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_state.thumbnails.len(), 10);
    assert_eq!(final_state.cache_images.len(), 10);
    let resume_job = harness
        .deps
        .jobs
        .get(&resume_job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resume_job.status, JobStatus::Completed);
}

#[tokio::test]
async fn cancelled_job_acknowledges_without_mutating() {
    let harness = Harness::new().await;
    let coll_dir = harness.library_path().join("CollA");
    write_jpeg(&coll_dir.join("1.jpg"), 64, 64);

    harness
        .orchestrator
        .trigger_library_scan(scan_request(&harness, LibraryId::generate()))
        .await
        .unwrap();
    harness.drive_queues(&["library-scan"]).await;

    let collection = harness
        .deps
        .collections
        .find_by_path(&coll_dir)
        .await
        .unwrap()
        .unwrap();
    let job = harness
        .deps
        .jobs
        .list_active()
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.collection_id == Some(collection.id))
        .unwrap();
    harness.orchestrator.cancel_job(&job.id).await.unwrap();

    harness.drive().await;

    let collection = harness
        .deps
        .collections
        .get(&collection.id)
        .await
        .unwrap()
        .unwrap();
    assert!(collection.images.is_empty(), "cancelled scan never mutated");
    let job = harness.deps.jobs.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn corrupt_archive_fails_the_scan_stage_once() {
    let harness = Harness::new().await;
    let zip_path = harness.library_path().join("broken.zip");
    std::fs::write(&zip_path, b"PK\x03\x04 truncated garbage").unwrap();

    harness
        .orchestrator
        .trigger_library_scan(scan_request(&harness, LibraryId::generate()))
        .await
        .unwrap();
    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let collection = harness
        .deps
        .collections
        .find_by_path(&zip_path)
        .await
        .unwrap()
        .unwrap();
    assert!(collection.images.is_empty());

    // The per-collection job failed with the archive error recorded.
    let mut failed_jobs: Vec<_> = Vec::new();
    for job in harness.deps.jobs.list_active().await.unwrap() {
        failed_jobs.push(job);
    }
    assert!(failed_jobs.is_empty(), "monitor moved the job to terminal");
}

#[tokio::test]
async fn dead_lettered_batch_replays_to_the_same_outcome() {
    let harness = Harness::new().await;
    let coll_dir = harness.library_path().join("CollA");
    for i in 0..6 {
        write_jpeg(&coll_dir.join(format!("{i}.jpg")), 100, 100);
    }

    harness
        .orchestrator
        .trigger_library_scan(scan_request(&harness, LibraryId::generate()))
        .await
        .unwrap();
    // The worker "crashes" before any derivative is generated; the broker
    // expires the backlog into the DLQ.
    harness
        .drive_queues(&["library-scan", "collection-scan", "image-process"])
        .await;
    let stranded_thumbs = harness.deps.broker.take("thumbnail-gen", 1000).await.unwrap();
    let stranded_cache = harness.deps.broker.take("cache-gen", 1000).await.unwrap();
    assert_eq!(stranded_thumbs.len(), 6);
    assert_eq!(stranded_cache.len(), 6);
    for envelope in stranded_thumbs.into_iter().chain(stranded_cache) {
        harness
            .deps
            .broker
            .publish(DLQ_QUEUE, envelope.headers, envelope.body)
            .await
            .unwrap();
    }

    // Boot-time recovery restores every message to its original queue.
    let report = DlqRecovery::new(harness.deps.broker.clone())
        .recover()
        .await
        .unwrap();
    assert_eq!(report.republished.get("thumbnail-gen"), Some(&6));
    assert_eq!(report.republished.get("cache-gen"), Some(&6));
    assert_eq!(report.skipped, 0);

    harness.drive().await;
    harness.monitor.tick().await.unwrap();

    let collection = harness
        .deps
        .collections
        .find_by_path(&coll_dir)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(collection.thumbnails.len(), 6, "identical to a clean run");
    assert_eq!(collection.cache_images.len(), 6);
    assert!(harness.deps.jobs.list_active().await.unwrap().is_empty());
}
