//! Pod phases and the monotonic merge of status polls and events.

use crate::naming::SCRIPT_CONTAINER;
use k8s_openapi::api::core::v1::Pod;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Unknown,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// The container has produced, or may be producing, log output.
    pub fn has_started(self) -> bool {
        matches!(
            self,
            PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            PodPhase::Unknown => 0,
            PodPhase::Pending => 1,
            PodPhase::Running => 2,
            PodPhase::Succeeded | PodPhase::Failed => 3,
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Unknown => "Unknown",
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSource {
    Poll,
    Event,
}

/// One observation of the pod's phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub source: PhaseSource,
    pub phase: PodPhase,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl PhaseReport {
    pub fn new(source: PhaseSource, phase: PodPhase) -> Self {
        Self {
            source,
            phase,
            exit_code: None,
            reason: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Read phase, exit code and reason off a polled pod.
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or(PodPhase::Unknown);

        let terminated = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|c| c.name == SCRIPT_CONTAINER))
            .and_then(|c| c.state.as_ref())
            .and_then(|state| state.terminated.as_ref());

        let mut report = PhaseReport::new(PhaseSource::Poll, phase);
        report.exit_code = terminated.map(|t| t.exit_code);
        report.reason = terminated
            .and_then(|t| t.message.clone().or_else(|| t.reason.clone()))
            .or_else(|| status.and_then(|s| s.message.clone().or_else(|| s.reason.clone())));
        report
    }
}

/// What the poller and the event watcher report to the tracking task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Phase(PhaseReport),
    /// Informational line for the execution's debug output.
    Diagnostic(String),
    /// The observer gave up while the pod may still be running.
    Lost(String),
}

/// Merged view of the pod's phase.
///
/// Only moves forward: Pending, then Running, then a terminal phase. Reports
/// that would move it backwards are dropped, Unknown is ignored and the
/// first terminal phase wins.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: PodPhase,
    exit_code: Option<i32>,
    reason: Option<String>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: PodPhase::Unknown,
            exit_code: None,
            reason: None,
        }
    }
}

impl PhaseTracker {
    pub fn phase(&self) -> PodPhase {
        self.phase
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Fold a report in. Returns true when the merged phase advanced.
    pub fn observe(&mut self, report: &PhaseReport) -> bool {
        if report.phase == PodPhase::Unknown {
            return false;
        }

        if report.phase.rank() > self.phase.rank() {
            self.phase = report.phase;
            self.exit_code = report.exit_code;
            if report.reason.is_some() {
                self.reason = report.reason.clone();
            }
            return true;
        }

        // A later report of the same terminal phase may carry details the
        // first one lacked.
        if report.phase == self.phase && self.phase.is_terminal() {
            if self.exit_code.is_none() {
                self.exit_code = report.exit_code;
            }
            if self.reason.is_none() {
                self.reason = report.reason.clone();
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll(phase: PodPhase) -> PhaseReport {
        PhaseReport::new(PhaseSource::Poll, phase)
    }

    fn event(phase: PodPhase) -> PhaseReport {
        PhaseReport::new(PhaseSource::Event, phase)
    }

    #[test]
    fn test_phase_never_regresses() {
        let mut tracker = PhaseTracker::default();
        assert!(tracker.observe(&event(PodPhase::Running)));
        assert!(!tracker.observe(&poll(PodPhase::Pending)));
        assert_eq!(tracker.phase(), PodPhase::Running);
    }

    #[test]
    fn test_unknown_is_ignored() {
        let mut tracker = PhaseTracker::default();
        assert!(tracker.observe(&poll(PodPhase::Pending)));
        assert!(!tracker.observe(&poll(PodPhase::Unknown)));
        assert_eq!(tracker.phase(), PodPhase::Pending);
    }

    #[test]
    fn test_first_terminal_phase_wins() {
        let mut tracker = PhaseTracker::default();
        assert!(tracker.observe(&event(PodPhase::Failed).with_reason("InvalidImageName")));
        assert!(!tracker.observe(&poll(PodPhase::Succeeded).with_exit_code(0)));
        assert_eq!(tracker.phase(), PodPhase::Failed);
        assert_eq!(tracker.reason(), Some("InvalidImageName"));
    }

    #[test]
    fn test_terminal_details_are_filled_in_later() {
        let mut tracker = PhaseTracker::default();
        tracker.observe(&event(PodPhase::Failed));
        assert_eq!(tracker.exit_code(), None);
        tracker.observe(&poll(PodPhase::Failed).with_exit_code(137).with_reason("OOMKilled"));
        assert_eq!(tracker.exit_code(), Some(137));
        assert_eq!(tracker.reason(), Some("OOMKilled"));
    }

    #[test]
    fn test_phase_can_skip_running() {
        let mut tracker = PhaseTracker::default();
        tracker.observe(&poll(PodPhase::Pending));
        assert!(tracker.observe(&poll(PodPhase::Succeeded).with_exit_code(0)));
        assert!(tracker.phase().is_terminal());
        assert!(tracker.phase().has_started());
    }

    #[test]
    fn test_report_from_pod() {
        use k8s_openapi::api::core::v1::{
            ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
        };
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Failed".into()),
                container_statuses: Some(vec![ContainerStatus {
                    name: SCRIPT_CONTAINER.into(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 3,
                            reason: Some("Error".into()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let report = PhaseReport::from_pod(&pod);
        assert_eq!(report.phase, PodPhase::Failed);
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.reason.as_deref(), Some("Error"));
    }
}
