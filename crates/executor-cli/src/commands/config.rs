use executor_core::AgentConfig;
use std::path::PathBuf;

const SAMPLE_CONFIG: &str = r#"# Script agent configuration

# Backend used when a request does not name one: process or pod
default_backend: process

orchestrator:
  # How long a cancelled execution may take before the caller is released
  cancel_grace_secs: 10

process:
  # SIGTERM to SIGKILL delay when cancelling a process tree
  termination_grace_secs: 5

pod:
  namespace: deployments
  image: busybox:stable
  # service_account: script-runner
  poll_interval_ms: 1000
  log_interval_ms: 1000
  max_observation_failures: 10
  deletion_timeout_secs: 30
  orphan_sweep_interval_secs: 60
  metrics_config_map: script-agent-metrics
  metrics_write_retries: 5
  agent_label: script-agent
"#;

pub async fn run(explicit: Option<&PathBuf>, path: bool, init: bool) -> anyhow::Result<()> {
    let config_path = explicit.cloned().unwrap_or_else(AgentConfig::default_path);

    if path {
        println!("{}", config_path.display());
        return Ok(());
    }

    if init {
        if config_path.exists() {
            println!("Config already exists at: {}", config_path.display());
            println!("Remove it first if you want to reinitialize.");
            return Ok(());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, SAMPLE_CONFIG)?;
        println!("Sample config written to: {}", config_path.display());
        return Ok(());
    }

    println!("Config path:     {}", config_path.display());
    let config = if config_path.exists() {
        AgentConfig::load_from(&config_path)?
    } else {
        println!("Status:          not found, using defaults");
        println!("Run `script-agent config --init` to create one.");
        AgentConfig::default()
    };
    println!("Default backend: {}", config.default_backend);
    println!("Namespace:       {}", config.pod.namespace);
    println!("Pod image:       {}", config.pod.image);
    println!("Agent label:     {}", config.pod.agent_label);

    Ok(())
}
