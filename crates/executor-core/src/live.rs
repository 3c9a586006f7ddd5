use crate::request::ExecutionId;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

/// Read side of the set of executions the orchestrator currently owns.
pub trait LiveExecutionSource: Send + Sync {
    /// Owned point-in-time copy.
    fn snapshot(&self) -> HashSet<ExecutionId>;
}

/// Execution ids that are between lock acquisition and final release.
#[derive(Debug, Clone, Default)]
pub struct LiveExecutions {
    ids: Arc<RwLock<HashSet<ExecutionId>>>,
}

impl LiveExecutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already live.
    pub fn insert(&self, id: ExecutionId) -> bool {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    pub fn remove(&self, id: &ExecutionId) -> bool {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LiveExecutionSource for LiveExecutions {
    fn snapshot(&self) -> HashSet<ExecutionId> {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Removes its id from the live set when dropped.
pub(crate) struct LiveRegistration {
    live: LiveExecutions,
    id: ExecutionId,
}

impl LiveRegistration {
    pub(crate) fn register(live: &LiveExecutions, id: ExecutionId) -> Self {
        live.insert(id.clone());
        Self {
            live: live.clone(),
            id,
        }
    }
}

impl Drop for LiveRegistration {
    fn drop(&mut self) {
        self.live.remove(&self.id);
    }
}
