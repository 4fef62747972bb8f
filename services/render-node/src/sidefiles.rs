//! Files the node leaves in its work directory for fleet tooling.
//!
//! - `task_count`: tasks completed by this agent, `"<n>\n"`
//! - `task_last`: unix time of the last completion, `"<secs>\n"`
//! - `framefarm.pid`: agent pid while it runs
//!
//! `farmctl tool prune` reads these over ssh to pick idle instances.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::NodeError;

pub const TASK_COUNT_FILE: &str = "task_count";
pub const TASK_LAST_FILE: &str = "task_last";
pub const PID_FILE: &str = "framefarm.pid";

/// Replace `path` with `contents` through a temporary sibling.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), NodeError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents).map_err(|e| NodeError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| NodeError::io(path, e))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Completion accounting files.
#[derive(Debug, Clone)]
pub struct SideFiles {
    dir: PathBuf,
}

impl SideFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Remove accounting left over from a previous run.
    pub fn clear(&self) -> Result<(), NodeError> {
        for name in [TASK_COUNT_FILE, TASK_LAST_FILE] {
            let path = self.dir.join(name);
            remove_if_present(&path).map_err(|e| NodeError::io(path, e))?;
        }
        Ok(())
    }

    /// Record that `count` tasks have completed, the latest just now.
    pub fn record(&self, count: u64) -> Result<(), NodeError> {
        write_atomic(&self.dir.join(TASK_COUNT_FILE), &format!("{count}\n"))?;
        write_atomic(
            &self.dir.join(TASK_LAST_FILE),
            &format!("{}\n", chrono::Utc::now().timestamp()),
        )?;
        debug!(count, "Recorded task completion");
        Ok(())
    }
}

/// Pid file, removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(dir: &Path) -> Result<Self, NodeError> {
        let path = dir.join(PID_FILE);
        write_atomic(&path, &format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}
