use crate::{dispatch, shutdown};
use executor_core::config::AgentConfig;
use executor_core::{spawn_background, BackendKind};
use std::sync::Arc;
use tracing::info;

/// Host the orchestrator and its background loops until shutdown.
///
/// Every pod carrying this agent's label that the orchestrator does not own
/// is treated as an orphan, so run one agent per label.
pub async fn run(config: &AgentConfig) -> anyhow::Result<()> {
    let (orchestrator, cluster) =
        dispatch::create_orchestrator(config, &[BackendKind::Process, BackendKind::Pod]).await?;
    let cluster = cluster.ok_or_else(|| anyhow::anyhow!("no cluster connection"))?;

    let shutdown = shutdown::install_shutdown_handler();
    let reconciler = Arc::new(cluster.reconciler(config, Arc::new(orchestrator.live_executions())));
    let sweeper = spawn_background(reconciler, shutdown.child_token());

    info!(
        namespace = %config.pod.namespace,
        agent_label = %config.pod.agent_label,
        default_backend = %config.default_backend,
        "Agent running"
    );
    shutdown.cancelled().await;
    sweeper.await?;
    info!("Agent stopped");
    Ok(())
}
