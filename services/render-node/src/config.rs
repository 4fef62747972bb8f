//! Configuration for the render node.

use std::path::PathBuf;
use std::time::Duration;

use framefarm_cloud::{QueueOptions, StoreOptions};
use framefarm_config::{ConfigError, Settings};
use framefarm_retry::RetryPolicy;

use crate::completion::DoneMode;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Work queue URL (`sqs://NAME` or `dir:///path`).
    pub work_queue: String,

    /// Output store URL (`s3://BUCKET[/PREFIX]` or `file:///path`).
    pub render_output: String,

    /// Project location: a directory or an archive URL.
    pub project: String,

    /// Ignore the stored ETag and always download the project again.
    pub project_always_refetch: bool,

    /// Scratch root for output directories, side files and the project cache.
    pub work_dir: PathBuf,

    pub visibility_timeout: Duration,

    /// Poll ticks between visibility renewals.
    pub reassert_ticks: u32,

    /// Sleep between process polls.
    pub poll_interval: Duration,

    pub retry: RetryPolicy,

    /// Treat a failed render as transient (redeliver) instead of fatal.
    pub render_failure_retry: bool,

    pub fetch_max_threads: usize,
    pub fetch_n_retries: u32,

    /// Completion mode when no `DONE` marker file exists.
    pub done: DoneMode,

    /// Sleep between queue re-checks in [`DoneMode::Poll`].
    pub done_poll_interval: Duration,

    /// Power off after exit regardless of the completion marker.
    pub shutdown: bool,

    pub s3_region: Option<String>,
    pub sqs_region: Option<String>,
}

impl NodeConfig {
    /// Build the node configuration from parsed settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let defaults = RetryPolicy::default();

        let config = Self {
            work_queue: settings.require("WORK_QUEUE")?.to_string(),
            render_output: settings.require("RENDER_OUTPUT")?.to_string(),
            project: settings.require("PROJECT")?.to_string(),
            project_always_refetch: settings.get_flag("PROJECT_ALWAYS_REFETCH", false)?,
            work_dir: PathBuf::from(settings.get("WORK_DIR").unwrap_or(".")),
            visibility_timeout: Duration::from_secs(settings.get_or("VISIBILITY_TIMEOUT", 120)?),
            reassert_ticks: settings.get_or("VISIBILITY_TIMEOUT_REASSERT", 30)?,
            poll_interval: Duration::from_millis(settings.get_or("POLL_INTERVAL_MS", 1000)?),
            retry: RetryPolicy {
                max_attempts: settings.get_or("N_RETRIES", defaults.max_attempts)?,
                reset_period: Duration::from_secs(
                    settings.get_or("RESET_PERIOD", defaults.reset_period.as_secs())?,
                ),
                pause: Duration::from_secs(settings.get_or("ERROR_PAUSE", defaults.pause.as_secs())?),
            },
            render_failure_retry: settings.get_flag("RENDER_FAILURE_RETRY", true)?,
            fetch_max_threads: settings.get_or("FETCH_MAX_THREADS", 16)?,
            fetch_n_retries: settings.get_or("FETCH_N_RETRIES", 4)?,
            done: settings.get_or("DONE", DoneMode::Stop)?,
            done_poll_interval: Duration::from_secs(settings.get_or("DONE_POLL_INTERVAL", 60)?),
            shutdown: settings.get_flag("SHUTDOWN", false)?,
            s3_region: settings.get("S3_REGION").map(str::to_string),
            sqs_region: settings.get("SQS_REGION").map(str::to_string),
        };
        config.check_reassert_period()?;
        Ok(config)
    }

    /// Messages are renewed every `reassert_ticks` polls; that period must
    /// be shorter than the visibility timeout or held messages reappear.
    fn check_reassert_period(&self) -> Result<(), ConfigError> {
        let period = self.poll_interval.saturating_mul(self.reassert_ticks);
        if period < self.visibility_timeout {
            return Ok(());
        }
        Err(ConfigError::Invalid {
            key: "VISIBILITY_TIMEOUT_REASSERT".to_string(),
            value: self.reassert_ticks.to_string(),
            reason: format!(
                "renewal every {}ms is not shorter than VISIBILITY_TIMEOUT of {}s",
                period.as_millis(),
                self.visibility_timeout.as_secs()
            ),
        })
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            visibility_timeout: self.visibility_timeout,
            region: self.sqs_region.clone(),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_threads: self.fetch_max_threads,
            n_retries: self.fetch_n_retries,
            region: self.s3_region.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Settings {
        Settings::parse_with(
            "WORK_QUEUE=dir:///spool\nRENDER_OUTPUT=file:///out\nPROJECT=file:///proj\n",
            |_| None,
        )
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_settings(&required()).unwrap();
        assert_eq!(config.visibility_timeout, Duration::from_secs(120));
        assert_eq!(config.reassert_ticks, 30);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(config.render_failure_retry);
        assert_eq!(config.done, DoneMode::Stop);
        assert_eq!(config.work_dir, PathBuf::from("."));
        assert!(!config.shutdown);
    }

    #[test]
    fn test_missing_required_key() {
        let settings = Settings::parse_with("WORK_QUEUE=dir:///spool\n", |_| None);
        let err = NodeConfig::from_settings(&settings).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "RENDER_OUTPUT"));
    }

    #[test]
    fn test_overrides() {
        let mut settings = required();
        settings.insert("N_RETRIES", "3");
        settings.insert("ERROR_PAUSE", "0");
        settings.insert("RENDER_FAILURE_RETRY", "0");
        settings.insert("DONE", "poll");

        let config = NodeConfig::from_settings(&settings).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.pause, Duration::ZERO);
        assert!(!config.render_failure_retry);
        assert_eq!(config.done, DoneMode::Poll);
    }

    #[test]
    fn test_reassert_period_must_beat_visibility_timeout() {
        let mut settings = required();
        settings.insert("VISIBILITY_TIMEOUT", "30");
        settings.insert("VISIBILITY_TIMEOUT_REASSERT", "30");
        settings.insert("POLL_INTERVAL_MS", "1000");
        let err = NodeConfig::from_settings(&settings).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Invalid { key, .. } if key == "VISIBILITY_TIMEOUT_REASSERT")
        );

        settings.insert("VISIBILITY_TIMEOUT_REASSERT", "29");
        assert!(NodeConfig::from_settings(&settings).is_ok());
    }

    #[test]
    fn test_invalid_number() {
        let mut settings = required();
        settings.insert("VISIBILITY_TIMEOUT", "soon");
        assert!(matches!(
            NodeConfig::from_settings(&settings),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
