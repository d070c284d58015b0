//! Imago server binary: configuration, tracing, backend wiring, the
//! worker runtime, and the axum API on top.

mod errors;
mod handlers;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use imago_core::{
    CacheFolderRepository, ImagoConfig, IndexService, IndexStore, MemoryBroker,
    MemoryIndexStore, MemoryStore, PipelineDeps, RedisIndexStore, WorkerRuntime,
};
use imago_model::CacheFolder;

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Arc::new(
        ImagoConfig::load(config_path.as_deref()).context("failed to load configuration")?,
    );

    let store = Arc::new(MemoryStore::new());
    if !config.store.url.starts_with("memory") {
        warn!(
            url = %config.store.url,
            "only the bundled in-process document store is built in; using it"
        );
    }
    let broker = Arc::new(MemoryBroker::new());
    if !config.broker.url.starts_with("memory") {
        warn!(
            url = %config.broker.url,
            "only the bundled in-process broker is built in; using it"
        );
    }

    let index_store: Arc<dyn IndexStore> = if config.cache.url.starts_with("redis://") {
        Arc::new(
            RedisIndexStore::connect(&config.cache.url)
                .await
                .context("failed to connect to the index cache")?,
        )
    } else {
        info!("using the in-memory index store");
        Arc::new(MemoryIndexStore::new())
    };
    let index = Arc::new(IndexService::new(index_store, store.clone(), &config));

    // Register configured cache folders and make sure their roots exist.
    for folder in &config.cache_folders {
        tokio::fs::create_dir_all(&folder.path)
            .await
            .with_context(|| format!("failed to create cache root {}", folder.path.display()))?;
        store
            .insert(CacheFolder::new(
                folder.path.clone(),
                folder.priority,
                folder.max_size_bytes,
            ))
            .await
            .context("failed to register cache folder")?;
        info!(path = %folder.path.display(), priority = folder.priority, "cache folder registered");
    }
    if config.cache_folders.is_empty() {
        warn!("no cache folders configured; derivative generation will stall until one is added");
    }

    let deps = PipelineDeps {
        collections: store.clone(),
        jobs: store.clone(),
        cache_folders: store.clone(),
        broker: broker.clone(),
        index,
        config: config.clone(),
    };

    let runtime = WorkerRuntime::start(deps.clone())
        .await
        .context("failed to start the worker runtime")?;

    let app = routes::router(AppState::new(deps));
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(addr = %config.server.bind, "imago server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    // In-flight messages are released back to their queues so the next
    // boot resumes the work.
    runtime.shutdown().await;
    Ok(())
}
