use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel exit codes reported when the execution unit never produced its own.
pub mod exit_codes {
    /// The unit could not be observed or launched.
    pub const FATAL: i32 = -42;
    /// Canceled by the caller, including forced termination.
    pub const CANCELED: i32 = -43;
    /// Cluster observation failed repeatedly while the pod was still running.
    pub const OBSERVATION_LOST: i32 = -46;
    /// The pod vanished before reporting a terminal phase.
    pub const POD_DISAPPEARED: i32 = -81;
}

/// Shared lifecycle vocabulary for every backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// Backend resources are gone. Internal only, never reported to the caller.
    Reclaimed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Succeeded | LifecycleState::Failed | LifecycleState::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Created, Running) => true,
            (Created | Running, Succeeded | Failed | Canceled) => true,
            (Succeeded | Failed | Canceled, Reclaimed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Succeeded => write!(f, "succeeded"),
            LifecycleState::Failed => write!(f, "failed"),
            LifecycleState::Canceled => write!(f, "canceled"),
            LifecycleState::Reclaimed => write!(f, "reclaimed"),
        }
    }
}

/// Terminal result handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub state: LifecycleState,
    pub exit_code: i32,
    pub diagnostic: Option<String>,
}

impl ExecutionResult {
    /// Succeeded on zero, Failed otherwise.
    pub fn from_exit_code(exit_code: i32) -> Self {
        Self {
            state: if exit_code == 0 {
                LifecycleState::Succeeded
            } else {
                LifecycleState::Failed
            },
            exit_code,
            diagnostic: None,
        }
    }

    pub fn failed(exit_code: i32, diagnostic: impl Into<String>) -> Self {
        Self {
            state: LifecycleState::Failed,
            exit_code,
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn canceled() -> Self {
        Self {
            state: LifecycleState::Canceled,
            exit_code: exit_codes::CANCELED,
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(LifecycleState::Succeeded.is_terminal());
        assert!(LifecycleState::Failed.is_terminal());
        assert!(LifecycleState::Canceled.is_terminal());
        assert!(!LifecycleState::Created.is_terminal());
        assert!(!LifecycleState::Running.is_terminal());
        assert!(!LifecycleState::Reclaimed.is_terminal());
    }

    #[test]
    fn test_transitions() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Created.can_transition_to(Failed));
        assert!(Running.can_transition_to(Canceled));
        assert!(Failed.can_transition_to(Reclaimed));
        assert!(!Running.can_transition_to(Created));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Reclaimed));
    }

    #[test]
    fn test_result_from_exit_code() {
        assert_eq!(
            ExecutionResult::from_exit_code(0).state,
            LifecycleState::Succeeded
        );
        let failed = ExecutionResult::from_exit_code(3);
        assert_eq!(failed.state, LifecycleState::Failed);
        assert_eq!(failed.exit_code, 3);
        assert_eq!(ExecutionResult::canceled().exit_code, exit_codes::CANCELED);
    }
}
