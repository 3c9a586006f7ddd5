use crate::lifecycle::{ExecutionResult, LifecycleState};
use crate::request::{BackendKind, ExecutionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runtime record the orchestrator keeps for one in-flight request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub backend: BackendKind,
    pub state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<ExecutionResult>,
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn new(execution_id: ExecutionId, backend: BackendKind, cancel: CancellationToken) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            backend,
            state: LifecycleState::Created,
            started_at: now,
            updated_at: now,
            finished_at: None,
            outcome: None,
            cancel,
        }
    }

    fn transition(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                execution_id = %self.execution_id,
                from = %self.state,
                to = %next,
                "Ignoring illegal lifecycle transition"
            );
            return false;
        }
        debug!(execution_id = %self.execution_id, from = %self.state, to = %next, "Lifecycle transition");
        self.state = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn mark_running(&mut self) {
        self.transition(LifecycleState::Running);
    }

    pub fn mark_finished(&mut self, result: &ExecutionResult) {
        if self.transition(result.state) {
            self.outcome = Some(result.clone());
            self.finished_at = Some(self.updated_at);
        }
    }

    pub fn mark_reclaimed(&mut self) {
        self.transition(LifecycleState::Reclaimed);
    }

    /// The terminal outcome, once one was recorded.
    pub fn result(&self) -> Option<&ExecutionResult> {
        self.outcome.as_ref()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}
