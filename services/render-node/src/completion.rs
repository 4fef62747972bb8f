//! What the node does once the work queue drains.
//!
//! The marker is re-read after every drained round, so an operator can flip
//! a polling node to `stop` or `shutdown` by writing `WORK_DIR/DONE`.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::NodeError;

/// Marker file name inside the work directory.
pub const DONE_FILE: &str = "DONE";

/// Post-drain behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DoneMode {
    /// Exit once the queue is empty.
    #[default]
    Stop,

    /// Keep checking the queue for new work.
    Poll,

    /// Exit and power off the host.
    Shutdown,
}

impl FromStr for DoneMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" | "exit" => Ok(Self::Stop),
            "poll" => Ok(Self::Poll),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(format!(
                "unknown completion mode {other:?} (expected stop, poll or shutdown)"
            )),
        }
    }
}

impl fmt::Display for DoneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Poll => write!(f, "poll"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Current completion mode.
///
/// The marker file wins over the configured default; `force_shutdown`
/// wins over both. An unreadable or malformed marker file falls back to
/// the configured default.
pub fn read_marker(work_dir: &Path, configured: DoneMode, force_shutdown: bool) -> DoneMode {
    if force_shutdown {
        return DoneMode::Shutdown;
    }

    let path = work_dir.join(DONE_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => match text.parse() {
            Ok(mode) => {
                debug!(path = %path.display(), mode = %mode, "Read completion marker");
                mode
            }
            Err(reason) => {
                warn!(path = %path.display(), %reason, "Ignoring malformed completion marker");
                configured
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => configured,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read completion marker");
            configured
        }
    }
}

/// Power off the host.
pub async fn power_off() -> Result<(), NodeError> {
    const SHUTDOWN: &str = "/sbin/shutdown";

    warn!("Powering off host");
    let status = Command::new(SHUTDOWN)
        .args(["-h", "0"])
        .status()
        .await
        .map_err(|e| NodeError::io(SHUTDOWN, e))?;
    if !status.success() {
        return Err(NodeError::io(
            SHUTDOWN,
            io::Error::other(format!("exited with {status}")),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("stop", DoneMode::Stop)]
    #[case("poll\n", DoneMode::Poll)]
    #[case(" Shutdown ", DoneMode::Shutdown)]
    fn test_parse(#[case] raw: &str, #[case] expected: DoneMode) {
        assert_eq!(raw.parse::<DoneMode>().unwrap(), expected);
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("reboot".parse::<DoneMode>().is_err());
    }

    #[test]
    fn test_marker_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_marker(dir.path(), DoneMode::Poll, false), DoneMode::Poll);

        std::fs::write(dir.path().join(DONE_FILE), "stop\n").unwrap();
        assert_eq!(read_marker(dir.path(), DoneMode::Poll, false), DoneMode::Stop);
        assert_eq!(
            read_marker(dir.path(), DoneMode::Poll, true),
            DoneMode::Shutdown
        );
    }

    #[test]
    fn test_malformed_marker_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DONE_FILE), "later").unwrap();
        assert_eq!(read_marker(dir.path(), DoneMode::Stop, false), DoneMode::Stop);
    }
}
