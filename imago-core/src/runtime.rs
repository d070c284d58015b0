//! Worker-role runtime: declares the broker topology, runs dead-letter
//! recovery, then supervises the consumer pools and the periodic loops
//! under one cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::QueueTopology;
use crate::dlq::{DlqRecovery, DlqRecoveryReport};
use crate::error::Result;
use crate::index::IndexReconciler;
use crate::monitor::JobMonitor;
use crate::pipeline::{
    CollectionScanConsumer, DerivativeConsumer, DerivativeKind, ImageProcessConsumer,
    LibraryScanConsumer, PipelineDeps, spawn_consumers,
};

const BROKER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorkerRuntime {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    dlq_report: DlqRecoveryReport,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("tasks", &self.handles.len())
            .finish()
    }
}

impl WorkerRuntime {
    /// Boots the worker role: topology, DLQ recovery, consumer pools,
    /// monitor, reconciler, and the broker TTL sweeper.
    pub async fn start(deps: PipelineDeps) -> Result<Self> {
        let config = deps.config.clone();

        deps.broker
            .declare_topology(&QueueTopology::pipeline(Duration::from_millis(
                config.broker.message_ttl_ms,
            )))
            .await?;

        // Restore whatever the last run lost to TTL expiry or retry
        // exhaustion before any consumer starts.
        let dlq_report = DlqRecovery::new(deps.broker.clone()).recover().await?;
        if dlq_report.total_republished() > 0 {
            info!(
                republished = dlq_report.total_republished(),
                "recovered dead-lettered messages at boot"
            );
        }

        let cancel = CancellationToken::new();
        let retry_max = config.broker.retry_max;
        let mut handles = Vec::new();

        handles.extend(spawn_consumers(
            deps.broker.clone(),
            Arc::new(LibraryScanConsumer::new(deps.clone())),
            config.workers.scan,
            retry_max,
            cancel.clone(),
        ));
        handles.extend(spawn_consumers(
            deps.broker.clone(),
            Arc::new(CollectionScanConsumer::new(deps.clone())),
            config.workers.scan,
            retry_max,
            cancel.clone(),
        ));
        handles.extend(spawn_consumers(
            deps.broker.clone(),
            Arc::new(ImageProcessConsumer::new(deps.clone())),
            config.workers.image,
            retry_max,
            cancel.clone(),
        ));
        handles.extend(spawn_consumers(
            deps.broker.clone(),
            Arc::new(DerivativeConsumer::new(deps.clone(), DerivativeKind::Thumbnail)),
            config.workers.thumbnail,
            retry_max,
            cancel.clone(),
        ));
        handles.extend(spawn_consumers(
            deps.broker.clone(),
            Arc::new(DerivativeConsumer::new(deps.clone(), DerivativeKind::Cache)),
            config.workers.cache,
            retry_max,
            cancel.clone(),
        ));

        handles.push(
            JobMonitor::new(
                deps.jobs.clone(),
                deps.collections.clone(),
                Duration::from_secs(config.monitor.interval_secs),
            )
            .spawn(cancel.clone()),
        );
        handles.push(
            IndexReconciler::new(
                deps.index.clone(),
                Duration::from_secs(config.index.reconcile_interval_secs),
            )
            .spawn(cancel.clone()),
        );

        // Broker-side TTL fallback for the in-process backend.
        let broker = deps.broker.clone();
        let sweep_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BROKER_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match broker.expire_overdue().await {
                    Ok(0) => {}
                    Ok(moved) => info!(moved, "expired overdue messages to the DLQ"),
                    Err(e) => warn!(error = %e, "TTL sweep failed"),
                }
            }
        }));

        info!(tasks = handles.len(), "worker runtime started");
        Ok(Self {
            cancel,
            handles,
            dlq_report,
        })
    }

    pub fn dlq_report(&self) -> &DlqRecoveryReport {
        &self.dlq_report
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cooperative shutdown: consumers release in-flight messages so the
    /// next boot resumes the work.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task join failed");
            }
        }
        info!("worker runtime stopped");
    }
}
