//! Incremental log tailing with a resumable offset.

use crate::api::PodApi;
use crate::retry::backoff_delay;
use chrono::{DateTime, Utc};
use executor_core::ExecutorError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the next read resumes: the newest timestamp delivered and how many
/// lines carrying exactly that timestamp were delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinceMarker {
    pub timestamp: DateTime<Utc>,
    pub consumed: usize,
}

/// Since markers by pod name.
#[derive(Debug, Clone, Default)]
pub struct SinceMarkerStore {
    markers: Arc<Mutex<HashMap<String, SinceMarker>>>,
}

impl SinceMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pod_name: &str) -> Option<SinceMarker> {
        self.lock().get(pod_name).copied()
    }

    pub fn set(&self, pod_name: &str, marker: SinceMarker) {
        self.lock().insert(pod_name.to_string(), marker);
    }

    pub fn remove(&self, pod_name: &str) -> Option<SinceMarker> {
        self.lock().remove(pod_name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SinceMarker>> {
        self.markers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reads a pod's log in increments, each picking up where the last
/// successful one stopped.
pub struct PodLogStreamer {
    api: Arc<dyn PodApi>,
    pod_name: String,
    markers: SinceMarkerStore,
    read_timeout: Duration,
}

impl PodLogStreamer {
    pub fn new(api: Arc<dyn PodApi>, pod_name: impl Into<String>, markers: SinceMarkerStore) -> Self {
        Self {
            api,
            pod_name: pod_name.into(),
            markers,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Bound on a single log request; a read that takes longer fails.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Lines logged since the stored marker. The marker only advances when
    /// the read succeeds, so a failed read is simply repeated.
    pub async fn read_new_lines(&self) -> Result<Vec<String>, ExecutorError> {
        let marker = self.markers.get(&self.pod_name);
        let raw = tokio::time::timeout(
            self.read_timeout,
            self.api.pod_logs(&self.pod_name, marker.map(|m| m.timestamp)),
        )
        .await
        .map_err(|_| {
            ExecutorError::Kubernetes(format!(
                "reading the log of pod {} timed out after {:?}",
                self.pod_name, self.read_timeout
            ))
        })??;
        let (lines, next) = select_new_lines(&raw, marker);
        if let Some(next) = next {
            self.markers.set(&self.pod_name, next);
        }
        debug!(pod = %self.pod_name, lines = lines.len(), "Read pod log");
        Ok(lines)
    }

    /// Final read after the pod finished, retried a few times.
    pub async fn drain(&self, attempts: u32, retry_base: Duration) -> Vec<String> {
        let mut lines = Vec::new();
        for attempt in 1..=attempts.max(1) {
            match self.read_new_lines().await {
                Ok(mut batch) => {
                    lines.append(&mut batch);
                    return lines;
                }
                Err(e) => {
                    warn!(pod = %self.pod_name, attempt, error = %e, "Final log read failed");
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(retry_base, attempt)).await;
                    }
                }
            }
        }
        lines
    }
}

/// Pick the lines of `raw` that come after `marker`, and the marker to
/// store once they are delivered.
pub fn select_new_lines(
    raw: &str,
    marker: Option<SinceMarker>,
) -> (Vec<String>, Option<SinceMarker>) {
    let mut lines = Vec::new();
    let mut next = marker;
    let mut seen_at_marker = 0usize;

    for line in raw.lines() {
        let Some((timestamp, text)) = split_timestamp(line) else {
            // Nothing to resume from; pass it through.
            lines.push(line.to_string());
            continue;
        };

        if let Some(marker) = marker {
            if timestamp < marker.timestamp {
                continue;
            }
            if timestamp == marker.timestamp {
                seen_at_marker += 1;
                if seen_at_marker <= marker.consumed {
                    continue;
                }
            }
        }

        lines.push(text.to_string());
        next = Some(match next {
            Some(n) if n.timestamp == timestamp => SinceMarker {
                timestamp,
                consumed: n.consumed + 1,
            },
            _ => SinceMarker {
                timestamp,
                consumed: 1,
            },
        });
    }
    (lines, next)
}

fn split_timestamp(line: &str) -> Option<(DateTime<Utc>, &str)> {
    let (stamp, text) = line.split_once(' ').unwrap_or((line, ""));
    let timestamp = DateTime::parse_from_rfc3339(stamp).ok()?;
    Some((timestamp.with_timezone(&Utc), text))
}
