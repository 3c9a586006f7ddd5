use crate::error::ExecutorError;
use crate::request::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration.
/// Loaded from ~/.config/script-agent/agent.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_backend")]
    pub default_backend: BackendKind,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub pod: PodConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long a cancelled execution may take to converge before the
    /// caller is released.
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Time between the graceful signal and the forced kill.
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,
    /// Consecutive failed cluster reads tolerated while the pod is running.
    #[serde(default = "default_max_observation_failures")]
    pub max_observation_failures: u32,
    #[serde(default = "default_deletion_timeout_secs")]
    pub deletion_timeout_secs: u64,
    #[serde(default = "default_orphan_sweep_interval_secs")]
    pub orphan_sweep_interval_secs: u64,
    #[serde(default = "default_metrics_config_map")]
    pub metrics_config_map: String,
    #[serde(default = "default_metrics_write_retries")]
    pub metrics_write_retries: u32,
    /// Value of the managed-by label stamped on every pod this agent creates.
    #[serde(default = "default_agent_label")]
    pub agent_label: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            orchestrator: OrchestratorConfig::default(),
            process: ProcessConfig::default(),
            pod: PodConfig::default(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            termination_grace_secs: default_termination_grace_secs(),
        }
    }
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_image(),
            service_account: None,
            poll_interval_ms: default_poll_interval_ms(),
            log_interval_ms: default_log_interval_ms(),
            max_observation_failures: default_max_observation_failures(),
            deletion_timeout_secs: default_deletion_timeout_secs(),
            orphan_sweep_interval_secs: default_orphan_sweep_interval_secs(),
            metrics_config_map: default_metrics_config_map(),
            metrics_write_retries: default_metrics_write_retries(),
            agent_label: default_agent_label(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Process
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_termination_grace_secs() -> u64 {
    5
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_image() -> String {
    "busybox:stable".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_log_interval_ms() -> u64 {
    1000
}

fn default_max_observation_failures() -> u32 {
    10
}

fn default_deletion_timeout_secs() -> u64 {
    30
}

fn default_orphan_sweep_interval_secs() -> u64 {
    60
}

fn default_metrics_config_map() -> String {
    "script-agent-metrics".to_string()
}

fn default_metrics_write_retries() -> u32 {
    5
}

fn default_agent_label() -> String {
    "script-agent".to_string()
}

impl AgentConfig {
    /// Load config from the default path, falling back to built-in defaults.
    pub fn load_default() -> Result<Self, ExecutorError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ExecutorError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("script-agent")
            .join("agent.yaml")
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.pod.namespace.trim().is_empty() {
            return Err(ExecutorError::Config("pod.namespace must not be empty".into()));
        }
        if self.pod.poll_interval_ms == 0 || self.pod.log_interval_ms == 0 {
            return Err(ExecutorError::Config(
                "pod poll and log intervals must be positive".into(),
            ));
        }
        if self.pod.orphan_sweep_interval_secs == 0 {
            return Err(ExecutorError::Config(
                "pod.orphan_sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl OrchestratorConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

impl ProcessConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

impl PodConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }

    pub fn deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.deletion_timeout_secs)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs)
    }
}
