//! Dead-letter recovery.
//!
//! The DLQ is the system's eventual-consistency backstop: messages that
//! expire or exceed their retry budget land there, and the worker role
//! drains it at boot, restoring each message to its original queue by the
//! `MessageType` header. Safe to repeat because every consumer mutation is
//! atomic and guarded by existence checks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{DLQ_QUEUE, MessageBroker, headers};
use crate::error::Result;

const DRAIN_BATCH: usize = 100;

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecoveryReport {
    /// Messages republished, keyed by original queue name.
    pub republished: HashMap<String, u64>,
    /// Messages lacking a valid `MessageType` header, left in the DLQ.
    pub skipped: u64,
}

impl DlqRecoveryReport {
    pub fn total_republished(&self) -> u64 {
        self.republished.values().sum()
    }
}

#[derive(Clone)]
pub struct DlqRecovery {
    broker: Arc<dyn MessageBroker>,
}

impl std::fmt::Debug for DlqRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlqRecovery").finish()
    }
}

impl DlqRecovery {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    /// Drains the DLQ once. Bounded by the depth observed at entry so a
    /// concurrent expiry cannot extend the drain indefinitely.
    pub async fn recover(&self) -> Result<DlqRecoveryReport> {
        let mut report = DlqRecoveryReport::default();
        let mut remaining = self.broker.depth(DLQ_QUEUE).await?;
        if remaining == 0 {
            return Ok(report);
        }
        info!(depth = remaining, "draining dead-letter queue");

        let mut unroutable = Vec::new();
        while remaining > 0 {
            let batch = self
                .broker
                .take(DLQ_QUEUE, DRAIN_BATCH.min(remaining))
                .await?;
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());

            for envelope in batch {
                let Some(message_type) = envelope.message_type() else {
                    warn!(id = %envelope.id, "dead-lettered message has no valid type header");
                    unroutable.push(envelope);
                    continue;
                };
                let mut republish_headers = envelope.headers.clone();
                republish_headers.insert(
                    headers::REDELIVERED_FROM_DLQ.to_string(),
                    "true".to_string(),
                );
                self.broker
                    .publish(message_type.queue(), republish_headers, envelope.body)
                    .await?;
                *report
                    .republished
                    .entry(message_type.queue().to_string())
                    .or_insert(0) += 1;
            }
        }

        // Unidentifiable messages stay in the DLQ for operator triage.
        report.skipped = unroutable.len() as u64;
        for envelope in unroutable {
            self.broker
                .publish(DLQ_QUEUE, envelope.headers, envelope.body)
                .await?;
        }

        info!(
            republished = report.total_republished(),
            skipped = report.skipped,
            "dead-letter recovery finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, QueueTopology};
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    async fn broker_with_dead_letters() -> Arc<MemoryBroker> {
        let broker = Arc::new(MemoryBroker::new());
        broker
            .declare_topology(&QueueTopology::pipeline(Duration::from_secs(3600)))
            .await
            .unwrap();
        broker
    }

    fn typed_headers(mt: &str) -> StdHashMap<String, String> {
        StdHashMap::from([(headers::MESSAGE_TYPE.to_string(), mt.to_string())])
    }

    #[tokio::test]
    async fn recovery_restores_messages_to_original_queues() {
        let broker = broker_with_dead_letters().await;
        // Simulate 12 thumbnail messages that expired into the DLQ.
        for _ in 0..12 {
            broker
                .publish("thumbnail-gen", typed_headers("thumbnail-gen"), b"{}".to_vec())
                .await
                .unwrap();
            let d = broker
                .pop("thumbnail-gen", Duration::from_millis(5))
                .await
                .unwrap()
                .unwrap();
            broker.nack("thumbnail-gen", d.tag, false).await.unwrap();
        }
        assert_eq!(broker.depth(DLQ_QUEUE).await.unwrap(), 12);

        let report = DlqRecovery::new(broker.clone()).recover().await.unwrap();
        assert_eq!(report.republished.get("thumbnail-gen"), Some(&12));
        assert_eq!(report.skipped, 0);
        assert_eq!(broker.depth("thumbnail-gen").await.unwrap(), 12);
        assert_eq!(broker.depth(DLQ_QUEUE).await.unwrap(), 0);

        let redelivered = broker
            .pop("thumbnail-gen", Duration::from_millis(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            redelivered
                .envelope
                .headers
                .get(headers::REDELIVERED_FROM_DLQ)
                .map(String::as_str),
            Some("true")
        );
    }

    #[tokio::test]
    async fn untyped_messages_stay_in_the_dlq() {
        let broker = broker_with_dead_letters().await;
        broker
            .publish(DLQ_QUEUE, StdHashMap::new(), b"mystery".to_vec())
            .await
            .unwrap();
        broker
            .publish(DLQ_QUEUE, typed_headers("image-process"), b"{}".to_vec())
            .await
            .unwrap();

        let report = DlqRecovery::new(broker.clone()).recover().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.republished.get("image-process"), Some(&1));
        assert_eq!(broker.depth(DLQ_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_dlq_is_a_no_op() {
        let broker = broker_with_dead_letters().await;
        let report = DlqRecovery::new(broker).recover().await.unwrap();
        assert_eq!(report.total_republished(), 0);
        assert_eq!(report.skipped, 0);
    }
}
