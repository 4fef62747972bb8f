//! Error handling and display for the CLI.

use colored::Colorize;
use framefarm_cloud::CloudError;
use framefarm_config::{ConfigError, DEFAULT_ENV_PREFIX};
use framefarm_retry::RetryError;
use thiserror::Error;

use crate::config::DEFAULT_CONFIG_FILE;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: CloudError,
    },

    /// Bad combination of arguments.
    #[error("{0}")]
    Usage(String),
}

impl From<RetryError<CloudError>> for CliError {
    fn from(err: RetryError<CloudError>) -> Self {
        match err {
            RetryError::Fatal(e) => Self::Cloud(e),
            RetryError::Exhausted { attempts, last } => Self::Exhausted { attempts, last },
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(hint) = err.downcast_ref::<CliError>().and_then(hint) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint(err: &CliError) -> Option<String> {
    match err {
        CliError::Config(ConfigError::Missing(key)) => Some(format!(
            "Set {key} in ~/{DEFAULT_CONFIG_FILE} or export {DEFAULT_ENV_PREFIX}{key}."
        )),
        CliError::Cloud(CloudError::Unsupported(backend)) => Some(format!(
            "This farmctl was built without {backend} support. Rebuild with `--features aws`."
        )),
        CliError::Exhausted { .. } => {
            Some("The provider kept failing. Raise N_RETRIES or try again later.".to_string())
        }
        _ => None,
    }
}
