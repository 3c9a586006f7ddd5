use crate::api::PodApi;
use crate::phase::{Observation, PhaseReport, PhaseSource, PodPhase};
use crate::retry::backoff_delay;
use executor_core::{exit_codes, ExecutorError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polls the pod's status until it reaches a terminal phase.
///
/// Transient API failures are retried with backoff; once
/// `max_failures` consecutive polls fail the poller reports the pod as
/// lost. A pod that vanished is reported as failed.
pub struct PodStatusPoller {
    api: Arc<dyn PodApi>,
    pod_name: String,
    interval: Duration,
    max_failures: u32,
}

impl PodStatusPoller {
    pub fn new(
        api: Arc<dyn PodApi>,
        pod_name: impl Into<String>,
        interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            api,
            pod_name: pod_name.into(),
            interval,
            max_failures: max_failures.max(1),
        }
    }

    pub async fn poll_once(&self) -> Result<PhaseReport, ExecutorError> {
        match self.api.get_pod(&self.pod_name).await? {
            Some(pod) => Ok(PhaseReport::from_pod(&pod)),
            None => Ok(PhaseReport::new(PhaseSource::Poll, PodPhase::Failed)
                .with_exit_code(exit_codes::POD_DISAPPEARED)
                .with_reason(format!("pod {} disappeared", self.pod_name))),
        }
    }

    pub async fn run(self, tx: UnboundedSender<Observation>, cancel: CancellationToken) {
        let mut failures = 0u32;
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let polled = tokio::select! {
                _ = cancel.cancelled() => return,
                polled = self.poll_once() => polled,
            };
            match polled {
                Ok(report) => {
                    failures = 0;
                    let terminal = report.phase.is_terminal();
                    debug!(pod = %self.pod_name, phase = %report.phase, "Polled pod status");
                    if tx.send(Observation::Phase(report)).is_err() || terminal {
                        return;
                    }
                    delay = self.interval;
                }
                Err(e) => {
                    failures += 1;
                    warn!(pod = %self.pod_name, failures, error = %e, "Pod status poll failed");
                    if failures >= self.max_failures {
                        let _ = tx.send(Observation::Lost(format!(
                            "status polling failed {} times in a row: {}",
                            failures, e
                        )));
                        return;
                    }
                    delay = backoff_delay(self.interval, failures);
                }
            }
        }
    }
}
