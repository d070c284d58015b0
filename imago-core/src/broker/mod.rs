//! Message-broker port.
//!
//! The engine publishes and consumes through this trait; the wire protocol
//! behind it is somebody else's problem. The contract mirrors a durable
//! topic-exchange topology: queue name equals routing key, every stage
//! queue carries a message TTL and dead-letters into the shared `dlq`
//! queue, and consumers acknowledge per message.

mod memory;

pub use memory::MemoryBroker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use imago_model::{MessageType, StageMessage};

use crate::error::Result;

pub const EXCHANGE_NAME: &str = "imago.exchange";
pub const DLQ_QUEUE: &str = "dlq";

pub mod headers {
    /// Stage name of the originating queue; the sole discriminator DLQ
    /// recovery uses to restore messages.
    pub const MESSAGE_TYPE: &str = "MessageType";
    pub const RETRY_COUNT: &str = "x-retry-count";
    pub const ORIGINAL_QUEUE: &str = "x-original-queue";
    pub const REDELIVERED_FROM_DLQ: &str = "x-redelivered-from-dlq";
}

#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: Uuid,
    pub routing_key: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(routing_key: &str, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing_key: routing_key.to_string(),
            headers,
            body,
            enqueued_at: Utc::now(),
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.headers
            .get(headers::MESSAGE_TYPE)
            .and_then(|value| value.parse().ok())
    }

    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(headers::RETRY_COUNT)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

/// A message handed to a consumer, addressed for ack/nack by tag.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub tag: u64,
}

#[derive(Clone, Debug)]
pub struct QueueSpec {
    pub name: String,
    pub message_ttl: Option<Duration>,
    pub dead_letter_to: Option<String>,
}

#[derive(Clone, Debug)]
pub struct QueueTopology {
    pub exchange: String,
    pub queues: Vec<QueueSpec>,
}

impl QueueTopology {
    /// The five stage queues plus the DLQ, as the pipeline declares them
    /// at boot.
    pub fn pipeline(message_ttl: Duration) -> Self {
        let mut queues: Vec<QueueSpec> = MessageType::ALL
            .iter()
            .map(|mt| QueueSpec {
                name: mt.queue().to_string(),
                message_ttl: Some(message_ttl),
                dead_letter_to: Some(DLQ_QUEUE.to_string()),
            })
            .collect();
        queues.push(QueueSpec {
            name: DLQ_QUEUE.to_string(),
            message_ttl: None,
            dead_letter_to: None,
        });
        Self {
            exchange: EXCHANGE_NAME.to_string(),
            queues,
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn declare_topology(&self, topology: &QueueTopology) -> Result<()>;

    async fn publish(
        &self,
        routing_key: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<()>;

    /// Waits up to `wait` for a delivery; `None` on timeout.
    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    async fn ack(&self, queue: &str, tag: u64) -> Result<()>;

    /// Failed handling. `requeue` bumps the retry counter and puts the
    /// message back; otherwise it dead-letters with its original queue
    /// name preserved in the headers.
    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<()>;

    /// Cancellation path: back on the queue without burning retry budget.
    async fn release(&self, queue: &str, tag: u64) -> Result<()>;

    async fn depth(&self, queue: &str) -> Result<usize>;

    /// Removes up to `max` ready messages (DLQ drain).
    async fn take(&self, queue: &str, max: usize) -> Result<Vec<Envelope>>;

    /// Routes TTL-overdue messages to their dead-letter queue; returns the
    /// number moved. Broker backends with native TTL may no-op.
    async fn expire_overdue(&self) -> Result<u64>;
}

/// Serializes a stage payload and publishes it to its queue with the
/// `MessageType` header set.
pub async fn publish_message(broker: &dyn MessageBroker, message: &StageMessage) -> Result<()> {
    let body = match message {
        StageMessage::LibraryScan(m) => serde_json::to_vec(m)?,
        StageMessage::CollectionScan(m) => serde_json::to_vec(m)?,
        StageMessage::ImageProcess(m) => serde_json::to_vec(m)?,
        StageMessage::ThumbnailGen(m) => serde_json::to_vec(m)?,
        StageMessage::CacheGen(m) => serde_json::to_vec(m)?,
    };
    let message_type = message.message_type();
    let mut message_headers = HashMap::new();
    message_headers.insert(
        headers::MESSAGE_TYPE.to_string(),
        message_type.as_str().to_string(),
    );
    broker
        .publish(message_type.queue(), message_headers, body)
        .await
}
