use crate::persistence::MetricsPersistence;
use chrono::{DateTime, Utc};
use executor_core::ExecutorError;
use std::sync::Arc;
use tracing::warn;

pub const PODS_CREATED: &str = "pods_created";
pub const PODS_DELETED: &str = "pods_deleted";
pub const ORPHANS_DELETED: &str = "orphans_deleted";
pub const LAST_ORPHAN_SWEEP: &str = "last_orphan_sweep";

/// Agent-wide counters kept in [`MetricsPersistence`].
///
/// Recording never fails the caller; a lost increment is only logged.
pub struct AgentMetrics {
    store: Arc<MetricsPersistence>,
}

impl AgentMetrics {
    pub fn new(store: Arc<MetricsPersistence>) -> Self {
        Self { store }
    }

    pub async fn counter(&self, key: &str) -> Result<u64, ExecutorError> {
        Ok(parse_counter(self.store.get(key).await?.as_deref()))
    }

    pub async fn last_orphan_sweep(&self) -> Result<Option<DateTime<Utc>>, ExecutorError> {
        Ok(self
            .store
            .get(LAST_ORPHAN_SWEEP)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc)))
    }

    /// Add `by` to a counter against its latest stored value.
    pub async fn increment(&self, key: &str, by: u64) -> Result<u64, ExecutorError> {
        let written = self
            .store
            .update(key, |current| {
                parse_counter(current).saturating_add(by).to_string()
            })
            .await?;
        Ok(parse_counter(Some(&written)))
    }

    pub async fn record_orphans_deleted(&self, count: u64) {
        if count == 0 {
            return;
        }
        if let Err(e) = self.increment(ORPHANS_DELETED, count).await {
            warn!(error = %e, "Failed to record deleted orphans");
        }
    }

    pub async fn record_orphan_sweep(&self, at: DateTime<Utc>) {
        if let Err(e) = self.store.set(LAST_ORPHAN_SWEEP, at.to_rfc3339()).await {
            warn!(error = %e, "Failed to record orphan sweep");
        }
    }

    /// Count a created pod in the background.
    pub fn record_pod_created(self: &Arc<Self>) {
        self.spawn_increment(PODS_CREATED);
    }

    /// Count a deleted pod in the background.
    pub fn record_pod_deleted(self: &Arc<Self>) {
        self.spawn_increment(PODS_DELETED);
    }

    fn spawn_increment(self: &Arc<Self>, key: &'static str) {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = metrics.increment(key, 1).await {
                warn!(metric = key, error = %e, "Failed to record metric");
            }
        });
    }
}

fn parse_counter(raw: Option<&str>) -> u64 {
    raw.and_then(|raw| raw.trim().parse().ok()).unwrap_or(0)
}
