//! Bundled in-process broker.
//!
//! Implements the durable-queue contract the pipeline is written against:
//! FIFO ready queues, unacked in-flight tracking, retry-counter headers,
//! and TTL expiry into the dead-letter queue. Single-node by design; a
//! networked AMQP backend would slot in behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::{Delivery, Envelope, MessageBroker, QueueSpec, QueueTopology, headers};
use crate::error::{ImagoError, Result};

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    inflight: HashMap<u64, Envelope>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            inflight: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    wakeup: Arc<Notify>,
    next_tag: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Moves an envelope into the dead-letter queue named by its source
    /// queue's DLX binding, stamping the original queue header.
    fn dead_letter(
        queues: &mut HashMap<String, QueueState>,
        source_queue: &str,
        mut envelope: Envelope,
    ) {
        let Some(target) = queues
            .get(source_queue)
            .and_then(|q| q.spec.dead_letter_to.clone())
        else {
            warn!(queue = source_queue, id = %envelope.id, "dropping message with no DLX binding");
            return;
        };
        envelope
            .headers
            .entry(headers::ORIGINAL_QUEUE.to_string())
            .or_insert_with(|| source_queue.to_string());
        match queues.get_mut(&target) {
            Some(dlq) => {
                debug!(queue = source_queue, id = %envelope.id, "message dead-lettered");
                dlq.ready.push_back(envelope);
            }
            None => {
                warn!(queue = source_queue, target, "DLX target queue not declared; message dropped");
            }
        }
    }

    /// Expires overdue ready messages on one queue. Returns moved count.
    fn expire_queue(queues: &mut HashMap<String, QueueState>, name: &str) -> u64 {
        let Some(ttl) = queues.get(name).and_then(|q| q.spec.message_ttl) else {
            return 0;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = Utc::now() - ttl;
        let mut expired = Vec::new();
        if let Some(queue) = queues.get_mut(name) {
            while queue
                .ready
                .front()
                .is_some_and(|env| env.enqueued_at < cutoff)
            {
                if let Some(env) = queue.ready.pop_front() {
                    expired.push(env);
                }
            }
        }
        let count = expired.len() as u64;
        for envelope in expired {
            Self::dead_letter(queues, name, envelope);
        }
        count
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_topology(&self, topology: &QueueTopology) -> Result<()> {
        let mut queues = self.queues.lock().await;
        for spec in &topology.queues {
            queues
                .entry(spec.name.clone())
                .or_insert_with(|| QueueState::new(spec.clone()));
        }
        debug!(
            exchange = %topology.exchange,
            queues = topology.queues.len(),
            "broker topology declared"
        );
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(routing_key).ok_or_else(|| {
            ImagoError::Validation(format!("no queue bound to routing key `{routing_key}`"))
        })?;
        queue
            .ready
            .push_back(Envelope::new(routing_key, headers, body));
        drop(queues);
        self.wakeup.notify_waiters();
        Ok(())
    }

    async fn pop(&self, queue_name: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.wakeup.notified();
            {
                let mut queues = self.queues.lock().await;
                if !queues.contains_key(queue_name) {
                    return Err(ImagoError::NotFound(format!("queue `{queue_name}`")));
                }
                Self::expire_queue(&mut queues, queue_name);
                if let Some(queue) = queues.get_mut(queue_name)
                    && let Some(envelope) = queue.ready.pop_front()
                {
                    let tag = self.next_tag();
                    queue.inflight.insert(tag, envelope.clone());
                    return Ok(Some(Delivery { envelope, tag }));
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Wait for a publish, or give up at the deadline.
            let _ = timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, queue_name: &str, tag: u64) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| ImagoError::NotFound(format!("queue `{queue_name}`")))?;
        queue
            .inflight
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| ImagoError::NotFound(format!("delivery tag {tag} on `{queue_name}`")))
    }

    async fn nack(&self, queue_name: &str, tag: u64, requeue: bool) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let envelope = {
            let queue = queues
                .get_mut(queue_name)
                .ok_or_else(|| ImagoError::NotFound(format!("queue `{queue_name}`")))?;
            queue.inflight.remove(&tag).ok_or_else(|| {
                ImagoError::NotFound(format!("delivery tag {tag} on `{queue_name}`"))
            })?
        };
        if requeue {
            let mut envelope = envelope;
            let retries = envelope.retry_count() + 1;
            envelope
                .headers
                .insert(headers::RETRY_COUNT.to_string(), retries.to_string());
            if let Some(queue) = queues.get_mut(queue_name) {
                queue.ready.push_back(envelope);
            }
        } else {
            Self::dead_letter(&mut queues, queue_name, envelope);
        }
        drop(queues);
        self.wakeup.notify_waiters();
        Ok(())
    }

    async fn release(&self, queue_name: &str, tag: u64) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| ImagoError::NotFound(format!("queue `{queue_name}`")))?;
        let envelope = queue.inflight.remove(&tag).ok_or_else(|| {
            ImagoError::NotFound(format!("delivery tag {tag} on `{queue_name}`"))
        })?;
        queue.ready.push_front(envelope);
        drop(queues);
        self.wakeup.notify_waiters();
        Ok(())
    }

    async fn depth(&self, queue_name: &str) -> Result<usize> {
        let queues = self.queues.lock().await;
        queues
            .get(queue_name)
            .map(|q| q.ready.len())
            .ok_or_else(|| ImagoError::NotFound(format!("queue `{queue_name}`")))
    }

    async fn take(&self, queue_name: &str, max: usize) -> Result<Vec<Envelope>> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| ImagoError::NotFound(format!("queue `{queue_name}`")))?;
        let count = queue.ready.len().min(max);
        Ok(queue.ready.drain(..count).collect())
    }

    async fn expire_overdue(&self) -> Result<u64> {
        let mut queues = self.queues.lock().await;
        let names: Vec<String> = queues.keys().cloned().collect();
        let mut moved = 0;
        for name in names {
            moved += Self::expire_queue(&mut queues, &name);
        }
        Ok(moved)
    }
}
