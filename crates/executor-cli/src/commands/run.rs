use crate::{dispatch, shutdown};
use executor_core::config::AgentConfig;
use executor_core::{
    BackendKind, Credential, ExecutionRequest, ExecutionResult, LifecycleState, OutputChannel,
    OutputLine,
};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

pub struct RunOptions {
    pub backend: Option<String>,
    pub workdir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub user: Option<String>,
    pub id: Option<String>,
    pub json: bool,
}

/// Suffix on the agent label of pods started by `run`.
const STANDALONE_LABEL_SUFFIX: &str = "-run";

/// Config for a one-shot run. Its pods carry their own label so a sweep by
/// the long-running agent never takes them for orphans.
pub fn standalone_config(config: &AgentConfig) -> AgentConfig {
    let mut config = config.clone();
    config.pod.agent_label = format!("{}{}", config.pod.agent_label, STANDALONE_LABEL_SUFFIX);
    config
}

/// Run one request to completion and return the exit code for this process.
pub async fn run(
    config: &AgentConfig,
    command: String,
    args: Vec<String>,
    options: RunOptions,
) -> anyhow::Result<i32> {
    let config = &standalone_config(config);
    let kind = match &options.backend {
        Some(name) => name.parse::<BackendKind>()?,
        None => config.default_backend,
    };
    let (orchestrator, _cluster) = dispatch::create_orchestrator(config, &[kind]).await?;

    let mut request = ExecutionRequest::new(command)
        .with_args(args)
        .with_backend(kind);
    if let Some(id) = options.id {
        request = request.with_id(id);
    }
    if let Some(dir) = options.workdir {
        request = request.with_working_dir(dir);
    }
    for (key, value) in options.env {
        request = request.with_env(key, value);
    }
    if let Some(user) = options.user {
        request = request.with_credential(Credential::new(user));
    }

    let json = options.json;
    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            print_line(&line, json);
        }
    });

    let cancel = shutdown::install_shutdown_handler();
    let result = orchestrator.execute(request, tx, cancel).await?;
    printer.await?;

    print_result(&result, json)?;
    Ok(process_exit_code(&result))
}

fn print_line(line: &OutputLine, json: bool) {
    if json {
        match serde_json::to_string(line) {
            Ok(encoded) => println!("{}", encoded),
            Err(e) => warn!(error = %e, "Failed to encode output line"),
        }
        return;
    }
    match line.channel {
        OutputChannel::Stdout => println!("{}", line.text),
        OutputChannel::Stderr => eprintln!("{}", line.text),
        OutputChannel::Debug => eprintln!("# {}", line.text),
    }
}

fn print_result(result: &ExecutionResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    eprintln!("# {} (exit code {})", result.state, result.exit_code);
    if let Some(diagnostic) = &result.diagnostic {
        eprintln!("# {}", diagnostic);
    }
    Ok(())
}

fn process_exit_code(result: &ExecutionResult) -> i32 {
    match result.state {
        LifecycleState::Succeeded => 0,
        _ if result.exit_code > 0 => result.exit_code,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standalone_pods_are_not_labelled_as_the_agent() {
        let config = AgentConfig::default();
        let standalone = standalone_config(&config);
        assert_eq!(
            standalone.pod.agent_label,
            format!("{}-run", config.pod.agent_label)
        );
        assert_eq!(standalone.pod.namespace, config.pod.namespace);
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(process_exit_code(&ExecutionResult::from_exit_code(0)), 0);
        assert_eq!(process_exit_code(&ExecutionResult::from_exit_code(3)), 3);
        assert_eq!(process_exit_code(&ExecutionResult::canceled()), 1);
    }
}
