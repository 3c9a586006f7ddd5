use executor_core::config::AgentConfig;
use executor_core::error::ExecutorError;
use executor_core::{BackendKind, ExecutionBackend, ExecutionOrchestrator, LiveExecutionSource};
use executor_pod::{
    AgentMetrics, KubeConfigMapApi, KubePodApi, MetricsPersistence, OrphanReconciler, PodApi,
    PodBackend,
};
use executor_process::ProcessBackend;
use std::sync::Arc;

/// Cluster-side collaborators shared by the pod backend and the reconciler.
pub struct Cluster {
    pub pods: Arc<dyn PodApi>,
    pub metrics: Arc<AgentMetrics>,
}

impl Cluster {
    pub async fn connect(config: &AgentConfig) -> Result<Self, ExecutorError> {
        let client = executor_pod::connect().await?;
        let namespace = &config.pod.namespace;
        let store = MetricsPersistence::new(
            Arc::new(KubeConfigMapApi::new(client.clone(), namespace)),
            config.pod.metrics_config_map.clone(),
            config.pod.metrics_write_retries,
        );
        Ok(Self {
            pods: Arc::new(KubePodApi::new(client, namespace)),
            metrics: Arc::new(AgentMetrics::new(Arc::new(store))),
        })
    }

    pub fn reconciler(
        &self,
        config: &AgentConfig,
        live: Arc<dyn LiveExecutionSource>,
    ) -> OrphanReconciler {
        OrphanReconciler::new(self.pods.clone(), live, &config.pod)
            .with_metrics(self.metrics.clone())
    }
}

/// Create a backend of the given kind from config.
pub fn create_backend(
    config: &AgentConfig,
    kind: BackendKind,
    cluster: Option<&Cluster>,
) -> Result<Arc<dyn ExecutionBackend>, ExecutorError> {
    match kind {
        BackendKind::Process => Ok(Arc::new(ProcessBackend::new(&config.process))),
        BackendKind::Pod => {
            let cluster = cluster.ok_or_else(|| {
                ExecutorError::BackendNotFound("pod (no cluster connection)".into())
            })?;
            Ok(Arc::new(
                PodBackend::new(cluster.pods.clone(), config.pod.clone())
                    .with_metrics(cluster.metrics.clone()),
            ))
        }
    }
}

/// An orchestrator with every backend that can be built here.
///
/// The cluster is only contacted when `kinds` includes the pod backend.
pub async fn create_orchestrator(
    config: &AgentConfig,
    kinds: &[BackendKind],
) -> Result<(ExecutionOrchestrator, Option<Cluster>), ExecutorError> {
    let cluster = if kinds.contains(&BackendKind::Pod) {
        Some(Cluster::connect(config).await?)
    } else {
        None
    };

    let mut orchestrator = ExecutionOrchestrator::from_config(config);
    for kind in kinds {
        orchestrator.register(create_backend(config, *kind, cluster.as_ref())?);
    }
    Ok((orchestrator, cluster))
}
