use crate::api::PodApi;
use crate::metrics::AgentMetrics;
use crate::naming::{execution_id_of, managed_by_selector};
use chrono::Utc;
use executor_core::config::PodConfig;
use executor_core::{BackgroundTask, ExecutorError, LiveExecutionSource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphans deleted this sweep.
    pub deleted: Vec<String>,
    /// Orphans whose deletion failed; retried next sweep.
    pub failed: Vec<String>,
    /// Pods left alone because their execution is live.
    pub live: usize,
}

/// Deletes pods carrying this agent's label whose execution is no longer
/// live, e.g. after a crash or a failed deletion.
pub struct OrphanReconciler {
    api: Arc<dyn PodApi>,
    live: Arc<dyn LiveExecutionSource>,
    selector: String,
    interval: Duration,
    metrics: Option<Arc<AgentMetrics>>,
}

impl OrphanReconciler {
    pub fn new(api: Arc<dyn PodApi>, live: Arc<dyn LiveExecutionSource>, config: &PodConfig) -> Self {
        Self {
            api,
            live,
            selector: managed_by_selector(&config.agent_label),
            interval: config.orphan_sweep_interval(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn sweep(&self) -> Result<SweepReport, ExecutorError> {
        // List before snapshotting: a pod in the list was created after its
        // execution registered, so a live owner is always in the snapshot.
        let pods = self.api.list_pods(&self.selector).await?;
        let live = self.live.snapshot();

        let mut report = SweepReport::default();
        for pod in pods {
            let Some(name) = pod.metadata.name.clone() else {
                continue;
            };
            match execution_id_of(&pod) {
                Some(id) if live.contains(&id) => {
                    report.live += 1;
                    continue;
                }
                owner => debug!(pod = %name, owner = ?owner.map(|id| id.to_string()), "Orphaned pod"),
            }

            match self.api.delete_pod(&name).await {
                Ok(()) => {
                    info!(pod = %name, "Deleted orphaned pod");
                    report.deleted.push(name);
                }
                Err(e) => {
                    warn!(pod = %name, error = %e, "Failed to delete orphaned pod");
                    report.failed.push(name);
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics
                .record_orphans_deleted(report.deleted.len() as u64)
                .await;
            metrics.record_orphan_sweep(Utc::now()).await;
        }
        Ok(report)
    }
}

#[async_trait::async_trait]
impl BackgroundTask for OrphanReconciler {
    fn name(&self) -> &str {
        "orphan-reconciler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) {
        match self.sweep().await {
            Ok(report) => {
                if !report.deleted.is_empty() || !report.failed.is_empty() {
                    info!(
                        deleted = report.deleted.len(),
                        failed = report.failed.len(),
                        live = report.live,
                        "Orphan sweep finished"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }
    }
}
