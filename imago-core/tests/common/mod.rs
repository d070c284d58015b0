//! Shared fixture for pipeline integration tests: in-process backends, a
//! temp library and cache root, and a deterministic queue driver that
//! stands in for the consumer pools.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use imago_core::broker::{MessageBroker, QueueTopology};
use imago_core::config::CacheFolderConfig;
use imago_core::monitor::JobMonitor;
use imago_core::pipeline::{
    CollectionScanConsumer, DerivativeConsumer, DerivativeKind, ImageProcessConsumer,
    LibraryScanConsumer, PipelineDeps, StageConsumer,
};
use imago_core::{
    CacheFolderRepository, ImagoConfig, IndexService, MemoryBroker, MemoryIndexStore, MemoryStore,
    ScanOrchestrator,
};
use imago_model::CacheFolder;

pub struct Harness {
    pub deps: PipelineDeps,
    pub orchestrator: ScanOrchestrator,
    pub monitor: JobMonitor,
    consumers: Vec<Box<dyn StageConsumer>>,
    pub library_root: tempfile::TempDir,
    pub cache_root: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let library_root = tempfile::tempdir().unwrap();
        let cache_root = tempfile::tempdir().unwrap();

        let config = Arc::new(ImagoConfig {
            cache_folders: vec![CacheFolderConfig {
                path: cache_root.path().to_path_buf(),
                priority: 0,
                max_size_bytes: 1 << 30,
            }],
            ..ImagoConfig::default()
        });

        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        broker
            .declare_topology(&QueueTopology::pipeline(Duration::from_millis(
                config.broker.message_ttl_ms,
            )))
            .await
            .unwrap();
        store
            .insert(CacheFolder::new(cache_root.path(), 0, 1 << 30))
            .await
            .unwrap();

        let index = Arc::new(IndexService::new(
            Arc::new(MemoryIndexStore::new()),
            store.clone(),
            &config,
        ));
        let deps = PipelineDeps {
            collections: store.clone(),
            jobs: store.clone(),
            cache_folders: store.clone(),
            broker,
            index,
            config,
        };

        let consumers: Vec<Box<dyn StageConsumer>> = vec![
            Box::new(LibraryScanConsumer::new(deps.clone())),
            Box::new(CollectionScanConsumer::new(deps.clone())),
            Box::new(ImageProcessConsumer::new(deps.clone())),
            Box::new(DerivativeConsumer::new(deps.clone(), DerivativeKind::Thumbnail)),
            Box::new(DerivativeConsumer::new(deps.clone(), DerivativeKind::Cache)),
        ];
        let orchestrator = ScanOrchestrator::new(deps.clone());
        let monitor = JobMonitor::new(store.clone(), store.clone(), Duration::from_secs(5));

        Self {
            deps,
            orchestrator,
            monitor,
            consumers,
            library_root,
            cache_root,
        }
    }

    /// Processes every queued message to quiescence, in stage order, the
    /// way the consumer pools would (minus the parallelism).
    pub async fn drive(&self) {
        let cancel = CancellationToken::new();
        loop {
            let mut handled = false;
            for consumer in &self.consumers {
                let queue = consumer.message_type().queue();
                let envelopes = self.deps.broker.take(queue, 1000).await.unwrap();
                for envelope in envelopes {
                    handled = true;
                    consumer
                        .handle(&envelope, &cancel)
                        .await
                        .unwrap_or_else(|e| panic!("{queue} handler failed: {e}"));
                }
            }
            if !handled {
                break;
            }
        }
    }

    /// Drains only the named queues once, leaving the rest untouched.
    pub async fn drive_queues(&self, queues: &[&str]) {
        let cancel = CancellationToken::new();
        loop {
            let mut handled = false;
            for consumer in &self.consumers {
                let queue = consumer.message_type().queue();
                if !queues.contains(&queue) {
                    continue;
                }
                let envelopes = self.deps.broker.take(queue, 1000).await.unwrap();
                for envelope in envelopes {
                    handled = true;
                    consumer
                        .handle(&envelope, &cancel)
                        .await
                        .unwrap_or_else(|e| panic!("{queue} handler failed: {e}"));
                }
            }
            if !handled {
                break;
            }
        }
    }

    pub fn library_path(&self) -> PathBuf {
        self.library_root.path().to_path_buf()
    }

    pub fn cache_files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
        let mut files = Vec::new();
        walk(self.cache_root.path(), &mut files);
        files
    }
}

/// Writes a real JPEG fixture of the given dimensions.
pub fn write_jpeg(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img = image::ImageBuffer::from_fn(width, height, |x, y| {
        image::Rgb([(x % 251) as u8, (y % 241) as u8, 77u8])
    });
    let mut bytes = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, 88);
    encoder.encode_image(&img).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// Writes a real PNG fixture.
pub fn write_png(path: &Path, width: u32, height: u32) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let img: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        image::ImageBuffer::from_pixel(width, height, image::Rgb([12, 90, 160]));
    img.save_with_format(path, image::ImageFormat::Png).unwrap();
}

/// Raw JPEG bytes for archive fixtures.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::ImageBuffer::from_fn(width, height, |x, y| {
        image::Rgb([(x % 17) as u8 * 10, (y % 13) as u8 * 11, 200u8])
    });
    let mut bytes = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, 88);
    encoder.encode_image(&img).unwrap();
    bytes
}
