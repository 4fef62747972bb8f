//! Process supervision.
//!
//! The task loop treats a running render and a running upload alike: both
//! are a [`SupervisedProcess`] it can poll without blocking and stop on
//! teardown.
//!
//! - [`RenderProcess`]: the task script as a child process in its own
//!   process group, so stopping it also reaps whatever the script started.
//! - [`UploadProcess`]: a tokio task pushing the output directory to the
//!   artifact store, aborted on stop.

use std::fmt;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use framefarm_cloud::ArtifactStore;
use framefarm_retry::RetryExecutor;
use futures_util::FutureExt;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::NodeError;

/// Exit code reported for a failed upload or an unknown status.
const FAILED_EXIT: i32 = 1;

/// A unit of work the task loop can poll and stop.
#[async_trait]
pub trait SupervisedProcess: Send + Sync + fmt::Debug {
    /// Exit code if the process has finished. Never blocks.
    fn poll(&mut self) -> Result<Option<i32>, NodeError>;

    /// Terminate the process (if still running) and wait for its exit code.
    async fn stop(&mut self) -> Result<i32, NodeError>;
}

/// Shell-style exit code: the status, or `128 + signal` when killed.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(FAILED_EXIT)
}

/// A render script running as a child process.
#[derive(Debug)]
pub struct RenderProcess {
    child: Child,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

impl RenderProcess {
    /// Start `script` with `project_dir` as its working directory.
    pub async fn spawn(script: &Path, project_dir: &Path) -> Result<Self, NodeError> {
        let mut busy_retries = 0;
        let child = loop {
            let spawned = Command::new(script)
                .current_dir(project_dir)
                .stdin(Stdio::null())
                .process_group(0)
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => break child,
                // A just-written script can still be open in a concurrently
                // forked child for a moment.
                Err(e) if e.kind() == io::ErrorKind::ExecutableFileBusy && busy_retries < 10 => {
                    busy_retries += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(NodeError::io(script, e)),
            }
        };
        let pid = child.id();

        info!(pid = ?pid, script = %script.display(), "Render process started");
        Ok(Self {
            child,
            pid,
            exit_code: None,
        })
    }
}

#[async_trait]
impl SupervisedProcess for RenderProcess {
    fn poll(&mut self) -> Result<Option<i32>, NodeError> {
        if self.exit_code.is_none() {
            let status = self
                .child
                .try_wait()
                .map_err(|e| NodeError::io("render process", e))?;
            self.exit_code = status.map(exit_code);
        }
        Ok(self.exit_code)
    }

    async fn stop(&mut self) -> Result<i32, NodeError> {
        if let Some(code) = self.poll()? {
            return Ok(code);
        }

        if let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) {
            debug!(pid, "Sending SIGTERM to render process group");
            match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "Failed to signal render process group"),
            }
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| NodeError::io("render process", e))?;
        let code = exit_code(status);
        self.exit_code = Some(code);
        Ok(code)
    }
}

/// Upload of a finished render's output directory.
#[derive(Debug)]
pub struct UploadProcess {
    handle: JoinHandle<Result<usize, NodeError>>,
    exit_code: Option<i32>,
}

impl UploadProcess {
    /// Start uploading every file below `output_dir`.
    pub fn start(
        store: Arc<dyn ArtifactStore>,
        output_dir: PathBuf,
        retry: RetryExecutor,
    ) -> Self {
        let handle = tokio::spawn(async move {
            retry
                .run(|| upload_dir(store.as_ref(), &output_dir))
                .await
                .map_err(NodeError::from)
        });
        Self {
            handle,
            exit_code: None,
        }
    }

    fn record(&mut self, joined: Result<Result<usize, NodeError>, tokio::task::JoinError>) -> i32 {
        let code = match joined {
            Ok(Ok(files)) => {
                info!(files, "Upload finished");
                0
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Upload failed");
                FAILED_EXIT
            }
            Err(e) if e.is_cancelled() => FAILED_EXIT,
            Err(e) => {
                warn!(error = %e, "Upload task panicked");
                FAILED_EXIT
            }
        };
        self.exit_code = Some(code);
        code
    }
}

#[async_trait]
impl SupervisedProcess for UploadProcess {
    fn poll(&mut self) -> Result<Option<i32>, NodeError> {
        if self.exit_code.is_some() || !self.handle.is_finished() {
            return Ok(self.exit_code);
        }
        Ok((&mut self.handle)
            .now_or_never()
            .map(|joined| self.record(joined)))
    }

    async fn stop(&mut self) -> Result<i32, NodeError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        self.handle.abort();
        let joined = (&mut self.handle).await;
        Ok(self.record(joined))
    }
}

/// Files below `dir` paired with their `/`-separated relative names.
fn output_files(dir: &Path) -> Result<Vec<(PathBuf, String)>, NodeError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            NodeError::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.into_path(), name));
    }
    Ok(files)
}

/// Upload every file below `dir`, returning how many were stored.
async fn upload_dir(store: &dyn ArtifactStore, dir: &Path) -> Result<usize, NodeError> {
    let files = output_files(dir)?;
    for (path, name) in &files {
        info!(file = %path.display(), url = %store.url_for(name), "Uploading");
        store.upload(path, name).await?;
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use framefarm_cloud::MemoryStore;
    use framefarm_retry::RetryPolicy;

    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("go");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn wait_for(process: &mut dyn SupervisedProcess) -> i32 {
        for _ in 0..200 {
            if let Some(code) = process.poll().unwrap() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("process did not finish");
    }

    #[tokio::test]
    async fn test_render_exit_codes() {
        let dir = tempfile::tempdir().unwrap();

        let ok = script(dir.path(), "#!/bin/sh\nexit 0\n");
        let mut process = RenderProcess::spawn(&ok, dir.path()).await.unwrap();
        assert_eq!(wait_for(&mut process).await, 0);
        // The result is sticky.
        assert_eq!(process.poll().unwrap(), Some(0));
        assert_eq!(process.stop().await.unwrap(), 0);

        let failing = script(dir.path(), "#!/bin/sh\nexit 3\n");
        let mut process = RenderProcess::spawn(&failing, dir.path()).await.unwrap();
        assert_eq!(wait_for(&mut process).await, 3);
    }

    #[tokio::test]
    async fn test_render_runs_in_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "#!/bin/sh\ntouch ran-here\n");
        let mut process = RenderProcess::spawn(&path, dir.path()).await.unwrap();
        assert_eq!(wait_for(&mut process).await, 0);
        assert!(dir.path().join("ran-here").exists());
    }

    #[tokio::test]
    async fn test_render_stop_terminates_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "#!/bin/sh\nsleep 30 &\nwait\n");
        let mut process = RenderProcess::spawn(&path, dir.path()).await.unwrap();
        assert_eq!(process.poll().unwrap(), None);

        let code = process.stop().await.unwrap();
        assert_eq!(code, 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn test_upload_pushes_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("beauty")).unwrap();
        std::fs::write(dir.path().join("frame_0001.png"), b"1").unwrap();
        std::fs::write(dir.path().join("beauty/frame_0001.exr"), b"2").unwrap();

        let store = Arc::new(MemoryStore::new());
        let mut upload = UploadProcess::start(
            store.clone(),
            dir.path().to_path_buf(),
            RetryExecutor::new(RetryPolicy::immediate(2)),
        );
        assert_eq!(wait_for(&mut upload).await, 0);
        assert_eq!(
            store.names(),
            vec!["beauty/frame_0001.exr".to_string(), "frame_0001.png".to_string()]
        );
    }

    #[tokio::test]
    async fn test_upload_failure_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frame.png"), b"1").unwrap();

        let store = Arc::new(MemoryStore::new());
        store.fail_next_uploads(5);
        let mut upload = UploadProcess::start(
            store.clone(),
            dir.path().to_path_buf(),
            RetryExecutor::new(RetryPolicy::immediate(2)),
        );
        assert_eq!(wait_for(&mut upload).await, 1);
        assert_eq!(store.upload_calls(), 2);
    }

    #[tokio::test]
    async fn test_upload_stop_aborts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frame.png"), b"1").unwrap();

        let store = Arc::new(MemoryStore::new());
        store.set_upload_delay(Duration::from_secs(30));
        let mut upload = UploadProcess::start(
            store.clone(),
            dir.path().to_path_buf(),
            RetryExecutor::new(RetryPolicy::immediate(1)),
        );
        assert_eq!(upload.poll().unwrap(), None);
        assert_eq!(upload.stop().await.unwrap(), 1);
        assert!(store.names().is_empty());
    }
}
