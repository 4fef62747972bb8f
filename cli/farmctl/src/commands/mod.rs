//! CLI commands.

mod filter;
mod fleet;
mod tool;
mod work;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use framefarm_cloud::{Compute, QueueOptions};
use framefarm_config::{Settings, DEFAULT_ENV_PREFIX};
use framefarm_retry::RetryExecutor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config;
use crate::error::CliError;

/// framefarm render farm control.
#[derive(Debug, Parser)]
#[command(name = "farmctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Settings file (default: ~/.framefarm.conf).
    #[arg(long, short = 'c', global = true, env = "FRAMEFARM_CONFIG")]
    config: Option<PathBuf>,

    /// Environment variables with this prefix override settings.
    #[arg(long, global = true, default_value = DEFAULT_ENV_PREFIX)]
    env_prefix: String,

    /// Log debug output to stderr.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Push, inspect and reset the work queue.
    Work(work::WorkCommand),

    /// Launch, bid for, stop and inspect render instances.
    Fleet(fleet::FleetCommand),

    /// Run commands across the running fleet.
    Tool(tool::ToolCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Install a compact stderr subscriber; `RUST_LOG` wins over `-v`.
    pub fn init_logging(&self) {
        let default = if self.verbose { "debug" } else { "warn" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        if let Commands::Version = self.command {
            println!("farmctl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }

        let settings = config::load(self.config.as_deref(), &self.env_prefix)?;
        let ctx = CommandContext::new(settings);

        match self.command {
            Commands::Work(cmd) => cmd.run(ctx).await,
            Commands::Fleet(cmd) => cmd.run(ctx).await,
            Commands::Tool(cmd) => cmd.run(ctx).await,
            Commands::Version => Ok(()),
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub settings: Settings,
}

impl CommandContext {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Executor for provider calls.
    pub fn retry(&self) -> Result<RetryExecutor, CliError> {
        Ok(RetryExecutor::new(config::retry_policy(&self.settings)?))
    }

    pub fn work_queue(&self) -> Result<&str, CliError> {
        Ok(self.settings.require("WORK_QUEUE")?)
    }

    pub fn queue_options(&self) -> Result<QueueOptions, CliError> {
        let defaults = QueueOptions::default();
        Ok(QueueOptions {
            visibility_timeout: std::time::Duration::from_secs(
                self.settings
                    .get_or("VISIBILITY_TIMEOUT", defaults.visibility_timeout.as_secs())?,
            ),
            region: self.settings.get("SQS_REGION").map(str::to_string),
        })
    }

    /// Connect to the compute provider.
    pub async fn compute(&self) -> Result<Arc<dyn Compute>, CliError> {
        #[cfg(feature = "aws")]
        {
            let region = self.settings.get("EC2_REGION");
            Ok(Arc::new(framefarm_cloud::Ec2Compute::connect(region).await))
        }
        #[cfg(not(feature = "aws"))]
        {
            Err(framefarm_cloud::CloudError::Unsupported("ec2").into())
        }
    }
}
