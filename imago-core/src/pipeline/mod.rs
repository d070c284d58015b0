//! Consumer framework for the five-stage ingestion pipeline.
//!
//! Each stage has a consumer pool draining its queue. A message is
//! acknowledged only after the aggregate mutation succeeds; transient
//! failures reject-with-requeue up to the retry cap and then dead-letter;
//! corruption fails its stage exactly once; cancellation releases the
//! message so the next boot resumes the work.

pub mod collection_scan;
pub mod derivative;
pub mod image_process;
pub mod library_scan;

pub use collection_scan::CollectionScanConsumer;
pub use derivative::{DerivativeConsumer, DerivativeKind};
pub use image_process::ImageProcessConsumer;
pub use library_scan::LibraryScanConsumer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use imago_model::{JobId, JobStatus, MessageType};

use crate::broker::{Delivery, Envelope, MessageBroker};
use crate::config::ImagoConfig;
use crate::error::{ImagoError, Result};
use crate::index::IndexService;
use crate::store::{CacheFolderRepository, CollectionRepository, JobRepository};

const POP_WAIT: Duration = Duration::from_millis(500);

/// Collaborators handed to every consumer. Passed explicitly; the only
/// process-wide shared state is the connection handles these wrap.
#[derive(Clone)]
pub struct PipelineDeps {
    pub collections: Arc<dyn CollectionRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub cache_folders: Arc<dyn CacheFolderRepository>,
    pub broker: Arc<dyn MessageBroker>,
    pub index: Arc<IndexService>,
    pub config: Arc<ImagoConfig>,
}

impl std::fmt::Debug for PipelineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDeps").finish()
    }
}

impl PipelineDeps {
    /// Checks whether the owning job was cancelled; consumers ack without
    /// mutating in that case.
    pub async fn job_cancelled(&self, job_id: &JobId) -> Result<bool> {
        Ok(self
            .jobs
            .get(job_id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Cancelled))
    }
}

/// One pipeline stage's message handler.
#[async_trait]
pub trait StageConsumer: Send + Sync {
    fn message_type(&self) -> MessageType;

    async fn handle(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<()>;
}

pub fn parse_body<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_slice(&envelope.body).map_err(ImagoError::from)
}

/// Spawns `workers` consumer tasks for one stage.
pub fn spawn_consumers(
    broker: Arc<dyn MessageBroker>,
    consumer: Arc<dyn StageConsumer>,
    workers: usize,
    retry_max: u32,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let broker = broker.clone();
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                consumer_loop(broker, consumer, retry_max, cancel, worker).await;
            })
        })
        .collect()
}

async fn consumer_loop(
    broker: Arc<dyn MessageBroker>,
    consumer: Arc<dyn StageConsumer>,
    retry_max: u32,
    cancel: CancellationToken,
    worker: usize,
) {
    let queue = consumer.message_type().queue();
    debug!(queue, worker, "consumer started");
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = broker.pop(queue, POP_WAIT) => delivery,
        };
        let delivery = match delivery {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(queue, worker, error = %e, "failed to poll queue");
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };
        handle_delivery(&*broker, &*consumer, retry_max, &cancel, delivery).await;
    }
    debug!(queue, worker, "consumer stopped");
}

async fn handle_delivery(
    broker: &dyn MessageBroker,
    consumer: &dyn StageConsumer,
    retry_max: u32,
    cancel: &CancellationToken,
    delivery: Delivery,
) {
    let queue = consumer.message_type().queue();
    let Delivery { envelope, tag } = delivery;

    // Shutdown between pop and handle: put the message straight back.
    if cancel.is_cancelled() {
        if let Err(e) = broker.release(queue, tag).await {
            warn!(queue, error = %e, "failed to release message during shutdown");
        }
        return;
    }

    let outcome = consumer.handle(&envelope, cancel).await;
    let result = match outcome {
        Ok(()) => broker.ack(queue, tag).await,
        Err(ImagoError::Cancelled(reason)) => {
            debug!(queue, id = %envelope.id, reason, "handler cancelled; releasing");
            broker.release(queue, tag).await
        }
        Err(e) if e.is_retryable() => {
            let retries = envelope.retry_count();
            if retries < retry_max {
                warn!(queue, id = %envelope.id, retries, error = %e, "transient failure; requeueing");
                broker.nack(queue, tag, true).await
            } else {
                error!(queue, id = %envelope.id, retries, error = %e, "retry budget exhausted; dead-lettering");
                broker.nack(queue, tag, false).await
            }
        }
        Err(e) => {
            // Validation/NotFound/Conflict/DataCorruption: permanent for
            // this message; the handler already recorded stage failure
            // where the policy demands it.
            warn!(queue, id = %envelope.id, error = %e, "permanent failure; acknowledging");
            broker.ack(queue, tag).await
        }
    };
    if let Err(e) = result {
        warn!(queue, id = %envelope.id, error = %e, "broker settle failed");
    }
}
