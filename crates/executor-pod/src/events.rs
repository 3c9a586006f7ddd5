use crate::api::PodApi;
use crate::phase::{Observation, PhaseReport, PhaseSource, PodPhase};
use crate::retry::backoff_delay;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IMAGE_FAILURES: [&str; 2] = ["InvalidImageName", "ErrImageNeverPull"];

/// Watches cluster events about one pod.
///
/// Events arrive sooner than the next status poll and carry better
/// diagnostics. The watcher is an accelerator only: when the events API
/// misbehaves it logs and stops, leaving the status poller in charge.
pub struct PodEventWatcher {
    api: Arc<dyn PodApi>,
    pod_name: String,
    pod_uid: String,
    retry_base: Duration,
    max_failures: u32,
}

impl PodEventWatcher {
    pub fn new(
        api: Arc<dyn PodApi>,
        pod_name: impl Into<String>,
        pod_uid: impl Into<String>,
        retry_base: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            api,
            pod_name: pod_name.into(),
            pod_uid: pod_uid.into(),
            retry_base,
            max_failures: max_failures.max(1),
        }
    }

    pub async fn run(self, tx: UnboundedSender<Observation>, cancel: CancellationToken) {
        let mut seen = HashSet::new();
        let mut failures = 0u32;
        loop {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => return,
                subscribed = self.api.watch_events(&self.pod_uid) => subscribed,
            };

            match subscribed {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            failures = 0;
                            if !seen.insert(event_key(&event)) {
                                continue;
                            }
                            for observation in interpret(&event) {
                                if tx.send(observation).is_err() {
                                    return;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            failures += 1;
                            warn!(pod = %self.pod_name, failures, error = %e, "Event watch failed");
                            break;
                        }
                        None => {
                            debug!(pod = %self.pod_name, "Event stream ended; resubscribing");
                            failures += 1;
                            break;
                        }
                    }
                },
                Err(e) => {
                    failures += 1;
                    warn!(pod = %self.pod_name, failures, error = %e, "Event watch unavailable");
                }
            }

            if failures >= self.max_failures {
                info!(pod = %self.pod_name, "Giving up on pod events; relying on status polling");
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff_delay(self.retry_base, failures)) => {}
            }
        }
    }
}

/// Translate one event into phase hints and diagnostic lines.
pub fn interpret(event: &Event) -> Vec<Observation> {
    let reason = event.reason.as_deref().unwrap_or_default();
    let message = event.message.as_deref().unwrap_or_default();
    let warning = event.type_.as_deref() == Some("Warning");

    let mut observations = Vec::new();
    if warning {
        observations.push(Observation::Diagnostic(format!("{}: {}", reason, message)));
    }

    let image_failure = IMAGE_FAILURES
        .iter()
        .any(|failure| reason == *failure || message.contains(failure));
    let phase = if image_failure {
        Some(PodPhase::Failed)
    } else {
        match reason {
            "Scheduled" => Some(PodPhase::Pending),
            "Pulled" | "Created" | "Started" => Some(PodPhase::Running),
            _ => None,
        }
    };

    if let Some(phase) = phase {
        let mut report = PhaseReport::new(PhaseSource::Event, phase);
        if phase == PodPhase::Failed {
            report = report.with_reason(format!("{}: {}", reason, message));
        }
        observations.push(Observation::Phase(report));
    }
    observations
}

fn event_key(event: &Event) -> String {
    let uid = event.metadata.uid.as_deref().unwrap_or_default();
    let name = event.metadata.name.as_deref().unwrap_or_default();
    format!("{}/{}/{}", uid, name, event.count.unwrap_or(1))
}
