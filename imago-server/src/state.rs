use std::sync::Arc;

use imago_core::{DlqRecovery, IndexService, PipelineDeps, ScanOrchestrator};

#[derive(Clone)]
pub struct AppState {
    pub deps: PipelineDeps,
    pub orchestrator: ScanOrchestrator,
    pub dlq: DlqRecovery,
}

impl AppState {
    pub fn new(deps: PipelineDeps) -> Self {
        let orchestrator = ScanOrchestrator::new(deps.clone());
        let dlq = DlqRecovery::new(deps.broker.clone());
        Self {
            deps,
            orchestrator,
            dlq,
        }
    }

    pub fn index(&self) -> &Arc<IndexService> {
        &self.deps.index
    }
}
