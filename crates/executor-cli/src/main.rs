use anyhow::Result;
use clap::{Parser, Subcommand};
use executor_core::AgentConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod dispatch;
mod shutdown;

#[derive(Parser)]
#[command(name = "script-agent")]
#[command(about = "Run deployment scripts as local processes or Kubernetes pods", long_about = None)]
struct Cli {
    /// Config file to use instead of the per-user default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one script and stream its output
    Run {
        /// Backend to run on (process or pod)
        #[arg(short, long)]
        backend: Option<String>,

        /// Working directory for the script
        #[arg(short = 'C', long)]
        workdir: Option<PathBuf>,

        /// Extra environment variable, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Local user to run as (process backend only)
        #[arg(short, long)]
        user: Option<String>,

        /// Execution id; generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Print output lines and the result as JSON
        #[arg(long)]
        json: bool,

        /// Command to run
        command: String,

        /// Arguments, passed through verbatim
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run the orphan reconciler until SIGINT or SIGTERM
    Agent {},

    /// Delete orphaned pods once and exit
    Reconcile {
        /// Sweep pods with this agent label instead of the configured one,
        /// e.g. script-agent-run after an interrupted `run`
        #[arg(long)]
        label: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or initialize the config file
    Config {
        /// Print the config path only
        #[arg(long)]
        path: bool,

        /// Write a sample config
        #[arg(long)]
        init: bool,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    Ok(match path {
        Some(path) => AgentConfig::load_from(path)?,
        None => AgentConfig::load_default()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Script output owns stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    use Commands::*;

    match cli.command {
        Run {
            backend,
            workdir,
            env,
            user,
            id,
            json,
            command,
            args,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let options = commands::run::RunOptions {
                backend,
                workdir,
                env,
                user,
                id,
                json,
            };
            let code = commands::run::run(&config, command, args, options).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Agent {} => {
            let config = load_config(cli.config.as_ref())?;
            commands::agent::run(&config).await?;
        }
        Reconcile { label, json } => {
            let config = load_config(cli.config.as_ref())?;
            commands::reconcile::run(&config, label, json).await?;
        }
        Config { path, init } => {
            commands::config::run(cli.config.as_ref(), path, init).await?;
        }
    }

    Ok(())
}
