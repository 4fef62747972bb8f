//! Error types for the render node.

use std::io;
use std::path::PathBuf;

use framefarm_cloud::CloudError;
use framefarm_config::ConfigError;
use framefarm_retry::{Classify, ErrorClass, RetryError};
use thiserror::Error;

use crate::task::TaskId;

/// Errors raised by the node agent.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Queue or store call failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// The render script of the active task exited non-zero.
    #[error("render of task {task_id} exited with status {exit_code}")]
    RenderFailed {
        task_id: TaskId,
        exit_code: i32,
        retryable: bool,
    },

    /// Uploading a finished render failed.
    #[error("upload of task {task_id} exited with status {exit_code}")]
    UploadFailed { task_id: TaskId, exit_code: i32 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A termination signal arrived.
    #[error("interrupted by signal")]
    Interrupted,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<NodeError>,
    },

    /// The project bundle could not be fetched or unpacked.
    #[error("project error: {0}")]
    Project(String),
}

impl NodeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl Classify for NodeError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Cloud(e) => e.class(),
            Self::RenderFailed { retryable, .. } if *retryable => ErrorClass::Transient,
            Self::RenderFailed { .. }
            | Self::UploadFailed { .. }
            | Self::Io { .. }
            | Self::Config(_)
            | Self::Interrupted
            | Self::RetriesExhausted { .. }
            | Self::Project(_) => ErrorClass::Fatal,
        }
    }
}

impl From<RetryError<NodeError>> for NodeError {
    fn from(err: RetryError<NodeError>) -> Self {
        match err {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

impl From<RetryError<CloudError>> for NodeError {
    fn from(err: RetryError<CloudError>) -> Self {
        match err {
            RetryError::Fatal(e) => Self::Cloud(e),
            RetryError::Exhausted { attempts, last } => Self::RetriesExhausted {
                attempts,
                last: Box::new(Self::Cloud(last)),
            },
        }
    }
}
