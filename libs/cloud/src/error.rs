//! Cloud error types.

use std::io;
use std::path::PathBuf;

use framefarm_retry::{Classify, ErrorClass};
use thiserror::Error;

/// Errors from queue, storage and compute backends.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The request never got a usable answer (connection, timeout, dispatch).
    #[error("{service} transport error: {message}")]
    Transport {
        service: &'static str,
        message: String,
    },

    /// The service answered with a retryable failure (throttling, 5xx).
    #[error("{service} service error: {message}")]
    Service {
        service: &'static str,
        message: String,
    },

    /// The service refused the request; retrying will not help.
    #[error("{service} rejected request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },

    /// The object changed while it was being read; start over.
    #[error("{service} object changed during read: {message}")]
    Modified {
        service: &'static str,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{0} backend is not compiled in (enable the `aws` feature)")]
    Unsupported(&'static str),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CloudError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

impl Classify for CloudError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { .. } | Self::Service { .. } | Self::Modified { .. } => {
                ErrorClass::Transient
            }
            Self::Io { source, .. } => source.class(),
            Self::Rejected { .. }
            | Self::NotFound(_)
            | Self::InvalidUrl { .. }
            | Self::Unsupported(_) => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transport = CloudError::Transport {
            service: "sqs",
            message: "connection reset".to_string(),
        };
        assert!(transport.class().is_transient());

        let rejected = CloudError::Rejected {
            service: "s3",
            message: "AccessDenied".to_string(),
        };
        assert!(!rejected.class().is_transient());

        let io = CloudError::io("/tmp/x", io::Error::from(io::ErrorKind::TimedOut));
        assert!(io.class().is_transient());

        assert!(!CloudError::Unsupported("sqs").class().is_transient());

        let modified = CloudError::Modified {
            service: "s3",
            message: "PreconditionFailed".to_string(),
        };
        assert!(modified.class().is_transient());
    }
}
