//! Shared AWS SDK plumbing.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

use crate::error::CloudError;

/// Error codes that signal a retryable server-side condition.
const RETRYABLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestThrottled",
    "SlowDown",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
];

/// Error code for a failed `If-Match` precondition.
const PRECONDITION_FAILED: &str = "PreconditionFailed";

/// Load SDK configuration from the standard credential chain, optionally
/// pinned to a region.
pub async fn load_config(region: Option<&str>) -> SdkConfig {
    let loader = aws_config::defaults(BehaviorVersion::latest());
    match region {
        Some(region) => loader.region(Region::new(region.to_string())).load().await,
        None => loader.load().await,
    }
}

/// Map an SDK error into the farm's taxonomy.
pub(crate) fn from_sdk<E, R>(service: &'static str, err: SdkError<E, R>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(ctx) => {
            let code = ctx.err().code().unwrap_or_default();
            if code == PRECONDITION_FAILED {
                CloudError::Modified { service, message }
            } else if RETRYABLE_CODES.contains(&code) {
                CloudError::Service { service, message }
            } else {
                CloudError::Rejected { service, message }
            }
        }
        _ => CloudError::Transport { service, message },
    }
}
