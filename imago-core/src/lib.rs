//! Core engine of the Imago image-library service.
//!
//! Four cooperating layers:
//!
//! 1. the message-driven ingestion pipeline ([`pipeline`], [`scanner`],
//!    [`media`]) — library-scan → collection-scan → image-process →
//!    thumbnail-gen / cache-gen, with per-stage progress and
//!    partial-failure recovery;
//! 2. the job-state model ([`monitor`], the repositories in [`store`]) —
//!    atomic stage counters reconciled into terminal status;
//! 3. the Redis-backed cross-collection index ([`index`]) — sorted-set
//!    rankings, denormalized summaries, incremental maintenance, and four
//!    rebuild strategies;
//! 4. dead-letter recovery and queue lifecycle ([`broker`], [`dlq`]).
//!
//! External collaborators (document store, broker wire protocol, key-value
//! cache) sit behind ports with bundled single-node backends.

pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod index;
pub mod media;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod runtime;
pub mod scanner;
pub mod store;

pub use broker::{MemoryBroker, MessageBroker};
pub use config::ImagoConfig;
pub use dlq::{DlqRecovery, DlqRecoveryReport};
pub use error::{ImagoError, Result};
pub use index::{
    IndexReconciler, IndexService, IndexStore, ListFilter, MemoryIndexStore, PageResult,
    PositionResult, RebuildMode, RebuildOptions, RebuildReport, RedisIndexStore,
};
pub use monitor::JobMonitor;
pub use orchestrator::{LibraryScanRequest, RescanOptions, ScanOrchestrator};
pub use pipeline::PipelineDeps;
pub use runtime::WorkerRuntime;
pub use store::{
    CacheFolderRepository, CollectionRepository, JobRepository, MemoryStore,
};
