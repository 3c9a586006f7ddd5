use crate::dispatch::Cluster;
use executor_core::config::AgentConfig;
use executor_core::LiveExecutions;
use std::sync::Arc;

/// The config a sweep runs with; `label` selects whose pods are swept.
pub fn sweep_config(config: &AgentConfig, label: Option<String>) -> AgentConfig {
    let mut config = config.clone();
    if let Some(label) = label {
        config.pod.agent_label = label;
    }
    config
}

/// One orphan sweep. Nothing runs in this process, so every pod carrying
/// the label counts as orphaned.
pub async fn run(config: &AgentConfig, label: Option<String>, json: bool) -> anyhow::Result<()> {
    let config = &sweep_config(config, label);
    let cluster = Cluster::connect(config).await?;
    let reconciler = cluster.reconciler(config, Arc::new(LiveExecutions::new()));
    let report = reconciler.sweep().await?;

    if json {
        let value = serde_json::json!({
            "namespace": config.pod.namespace,
            "agent_label": config.pod.agent_label,
            "deleted": report.deleted,
            "failed": report.failed,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    if report.deleted.is_empty() && report.failed.is_empty() {
        println!("No orphaned pods in {}.", config.pod.namespace);
        return Ok(());
    }
    for name in &report.deleted {
        println!("  deleted  {}", name);
    }
    for name in &report.failed {
        println!("  FAILED   {}", name);
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} orphaned pod(s) could not be deleted", report.failed.len());
    }
    Ok(())
}
