//! Settings loading for the CLI.
//!
//! Settings come from `--config FILE` or `~/.framefarm.conf`, with
//! `FRAMEFARM_*` environment variables layered on top. A missing default
//! file is fine; every key then has to come from the environment.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use framefarm_config::{ConfigError, Settings};
use framefarm_retry::RetryPolicy;
use tracing::debug;

/// Settings file looked up in the home directory.
pub const DEFAULT_CONFIG_FILE: &str = ".framefarm.conf";

/// `~/.framefarm.conf`, if a home directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(DEFAULT_CONFIG_FILE))
}

/// Load settings from `explicit`, or from the default file if it exists.
pub fn load(explicit: Option<&Path>, env_prefix: &str) -> Result<Settings, ConfigError> {
    let settings = match explicit {
        Some(path) => Settings::load_file(path)?,
        None => match default_config_path() {
            Some(path) => match Settings::load_file(&path) {
                Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No settings file, using environment only");
                    Settings::new()
                }
                other => other?,
            },
            None => Settings::new(),
        },
    };
    Ok(settings.with_env_prefix(env_prefix))
}

/// Retry policy for provider calls (`N_RETRIES`, `RESET_PERIOD`,
/// `ERROR_PAUSE`).
pub fn retry_policy(settings: &Settings) -> Result<RetryPolicy, ConfigError> {
    let defaults = RetryPolicy::default();
    Ok(RetryPolicy {
        max_attempts: settings.get_or("N_RETRIES", defaults.max_attempts)?,
        reset_period: Duration::from_secs(
            settings.get_or("RESET_PERIOD", defaults.reset_period.as_secs())?,
        ),
        pause: Duration::from_secs(settings.get_or("ERROR_PAUSE", defaults.pause.as_secs())?),
    })
}

/// A command-line flag, else a settings key, else `default`.
pub fn flag_or_setting(flag: Option<&str>, settings: &Settings, key: &str, default: &str) -> String {
    flag.or_else(|| settings.get(key))
        .unwrap_or(default)
        .to_string()
}

/// A command-line flag, else a settings key, else a missing-key error.
pub fn flag_or_required(
    flag: Option<&str>,
    settings: &Settings,
    key: &str,
) -> Result<String, ConfigError> {
    match flag {
        Some(value) => Ok(value.to_string()),
        None => settings.require(key).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_file_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("farm.conf");
        std::fs::write(&path, "WORK_QUEUE=dir:///a\nN_RETRIES=2\n").unwrap();

        let settings = load(Some(&path), "FARMCTL_TEST_UNSET_PREFIX_").unwrap();
        assert_eq!(settings.get("WORK_QUEUE"), Some("dir:///a"));
        assert_eq!(retry_policy(&settings).unwrap().max_attempts, 2);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(Some(&dir.path().join("nope.conf")), "FARMCTL_TEST_UNSET_PREFIX_");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_flag_precedence() {
        let settings = Settings::parse_with("INSTANCE_TYPE=c5.large\n", |_| None);
        assert_eq!(
            flag_or_setting(Some("m5.xlarge"), &settings, "INSTANCE_TYPE", "m2.xlarge"),
            "m5.xlarge"
        );
        assert_eq!(
            flag_or_setting(None, &settings, "INSTANCE_TYPE", "m2.xlarge"),
            "c5.large"
        );
        assert_eq!(
            flag_or_setting(None, &Settings::new(), "INSTANCE_TYPE", "m2.xlarge"),
            "m2.xlarge"
        );
        assert!(matches!(
            flag_or_required(None, &settings, "AMI_ID"),
            Err(ConfigError::Missing(key)) if key == "AMI_ID"
        ));
    }
}
