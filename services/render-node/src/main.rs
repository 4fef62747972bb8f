//! framefarm render node
//!
//! Reads its settings from `--config FILE` or stdin (the instance boot
//! script pipes them through a heredoc), then works the queue until it
//! drains. Exits 0 on normal completion and 1 on a fatal error or signal.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use framefarm_config::{Settings, DEFAULT_ENV_PREFIX};
use framefarm_node::completion::power_off;
use framefarm_node::logging::{self, LogFormat};
use framefarm_node::{run_agent, signals, NodeConfig};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "framefarm-node", version, about = "Render node agent")]
struct Args {
    /// Settings file (KEY=VALUE lines); read from stdin when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment variables with this prefix override settings.
    #[arg(long, default_value = DEFAULT_ENV_PREFIX)]
    env_prefix: String,

    /// Power off the host once the agent exits.
    #[arg(long)]
    shutdown: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Render node failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("Starting framefarm render node");

    let settings = match &args.config {
        Some(path) => Settings::load_file(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?,
        None => Settings::load_stdin().context("failed to read settings from stdin")?,
    }
    .with_env_prefix(&args.env_prefix);

    let config = NodeConfig::from_settings(&settings)?;
    info!(
        work_queue = %config.work_queue,
        render_output = %config.render_output,
        project = %config.project,
        work_dir = %config.work_dir.display(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = signals::spawn_listener(shutdown_tx)?;

    let result = run_agent(&config, args.shutdown, shutdown_rx).await;
    listener.abort();
    let outcome = result?;

    if outcome.power_off {
        info!("Powering off");
        power_off().await?;
    }
    info!("Render node exiting");
    Ok(())
}
