//! Farm settings.
//!
//! Settings are plain `KEY=VALUE` lines. The same format is read by the
//! render node (usually piped in by the instance boot script) and by
//! `farmctl`, and written back out by `farmctl fleet script`.
//!
//! ```text
//! WORK_QUEUE=sqs://frames
//! RENDER_OUTPUT="s3://renders/$SHOT/"
//! LITERAL='no $expansion here'
//! ```
//!
//! Unquoted and double-quoted values expand `$NAME` and `${NAME}` from keys
//! defined earlier in the file, then from the process environment, and
//! otherwise to the empty string. Environment variables carrying the
//! configured prefix override file values.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

/// Default prefix for environment overrides.
pub const DEFAULT_ENV_PREFIX: &str = "FRAMEFARM_";

/// Settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config key {0:?} is missing")]
    Missing(String),

    #[error("config key {key:?} has invalid value {value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Parsed settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings text, expanding macros against the process environment.
    pub fn parse(text: &str) -> Self {
        Self::parse_with(text, |name| std::env::var(name).ok())
    }

    /// Parse settings text with an explicit environment lookup.
    pub fn parse_with<F>(text: &str, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::new();
        for line in text.lines() {
            if let Some((key, value)) = parse_line(line) {
                let value = match value {
                    Value::Literal(v) => v.to_string(),
                    Value::Expand(v) => expand(v, |name| {
                        settings.values.get(name).cloned().or_else(|| env(name))
                    }),
                };
                settings.values.insert(key.to_string(), value);
            }
        }
        settings
    }

    /// Load settings from a file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(Self::parse(&text))
    }

    /// Load settings from standard input.
    pub fn load_stdin() -> Result<Self, ConfigError> {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<stdin>"),
                source,
            })?;
        Ok(Self::parse(&text))
    }

    /// Apply overrides from the process environment.
    pub fn with_env_prefix(self, prefix: &str) -> Self {
        self.with_overrides(std::env::vars(), prefix)
    }

    /// Apply overrides from `vars`, keeping only names that start with
    /// `prefix` and stripping it.
    pub fn with_overrides<I>(mut self, vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if prefix.is_empty() {
            return self;
        }
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(prefix) {
                if !key.is_empty() {
                    self.values.insert(key.to_string(), value);
                }
            }
        }
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Value for `key`; empty values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Value for `key`, or [`ConfigError::Missing`].
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Parsed value for `key`, or `default` when unset.
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Boolean flag: `1`/`true`/`yes`/`on` or `0`/`false`/`no`/`off`.
    pub fn get_flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: v,
                    reason: "expected 0 or 1".to_string(),
                }),
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

enum Value<'a> {
    Literal(&'a str),
    Expand(&'a str),
}

fn parse_line(line: &str) -> Option<(&str, Value<'_>)> {
    let line = line.trim();
    let (key, value) = line.split_once('=')?;
    if key.is_empty() || !key.chars().all(is_word_char) {
        return None;
    }

    let bytes = value.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[0] == bytes[bytes.len() - 1]
    {
        let inner = &value[1..value.len() - 1];
        if bytes[0] == b'\'' {
            return Some((key, Value::Literal(inner)));
        }
        return Some((key, Value::Expand(inner)));
    }
    Some((key, Value::Expand(value)))
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Expand `$NAME` and `${NAME}` references.
fn expand<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if braced[..end].chars().all(is_word_char) && end > 0 => {
                    (&braced[..end], end + 2)
                }
                _ => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !is_word_char(c))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
            rest = after;
        } else {
            out.push_str(&lookup(name).unwrap_or_default());
            rest = &after[consumed..];
        }
    }
    out.push_str(rest);
    out
}
