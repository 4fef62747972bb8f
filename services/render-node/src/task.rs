//! Render task state.

use std::fmt;
use std::path::{Path, PathBuf};

use framefarm_cloud::Message;

use crate::supervisor::SupervisedProcess;

/// Placeholder replaced by the task's output directory.
pub const OUTDIR_MACRO: &str = "$OUTDIR";

/// Interpreter line added to scripts that carry none.
pub const DEFAULT_SHEBANG: &str = "#!/bin/bash\n";

/// Locally assigned task number, increasing for the life of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two slots a task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Rendering.
    Active,

    /// Uploading a finished render.
    Push,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Push => write!(f, "push"),
        }
    }
}

/// Where a task stands within its current role.
#[derive(Debug)]
pub enum Phase {
    /// No process attached yet.
    Pending,

    /// Process attached and not yet reported finished.
    Running(Box<dyn SupervisedProcess>),

    /// Process finished with this exit code.
    Exited(i32),
}

/// One delivery of a queued render.
#[derive(Debug)]
pub struct Task {
    pub id: TaskId,

    /// Delivery handle; `None` once deleted or released.
    pub message: Option<Message>,

    /// Private scratch directory receiving the render output.
    pub output_dir: Option<PathBuf>,

    pub phase: Phase,
}

impl Task {
    pub fn new(id: TaskId, message: Message) -> Self {
        Self {
            id,
            message: Some(message),
            output_dir: None,
            phase: Phase::Pending,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running(_))
    }

    /// Attach the process for the next role, forgetting the previous exit.
    pub fn attach(&mut self, process: Box<dyn SupervisedProcess>) {
        self.phase = Phase::Running(process);
    }

    /// Detach the live process, if any, leaving the task pending.
    pub fn take_process(&mut self) -> Option<Box<dyn SupervisedProcess>> {
        match std::mem::replace(&mut self.phase, Phase::Pending) {
            Phase::Running(process) => Some(process),
            other => {
                self.phase = other;
                None
            }
        }
    }
}

/// Turn a message body into the executable render script.
///
/// Every `$OUTDIR` is replaced by `output_dir`, then a bash shebang is
/// prepended unless the script already starts with `#!`.
pub fn prepare_script(body: &str, output_dir: &Path) -> String {
    let script = body.replace(OUTDIR_MACRO, &output_dir.to_string_lossy());
    if script.starts_with("#!") {
        script
    } else {
        format!("{DEFAULT_SHEBANG}{script}")
    }
}
