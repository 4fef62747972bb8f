//! The render task loop.
//!
//! Up to two tasks are in flight at once, one per [`Role`]:
//!
//! - **active**: its render script is running.
//! - **push**: its render succeeded and its output is being uploaded.
//!
//! While the active task renders, the previous task's upload runs beside
//! it, overlapping CPU-bound and network-bound work.
//!
//! # Invariants
//!
//! - A queue message is deleted only after the upload of its output has
//!   reported success.
//! - A task's output directory is removed only once its process is stopped.
//! - Every message held by a live process has its visibility renewed every
//!   `reassert_ticks` polls.
//! - Whatever ends a session (drained queue, error, cancellation), both
//!   slots are torn down: messages return to the queue immediately,
//!   processes are stopped, output directories removed.
//!
//! A failed session is retried as a whole under the [`RetryPolicy`]; the
//! interrupted message is redelivered by the queue rather than retried
//! in place.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use framefarm_cloud::{ArtifactStore, Message, WorkQueue};
use framefarm_retry::{RetryExecutor, RetryPolicy};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::sidefiles::{write_atomic, SideFiles};
use crate::signals::cancelled;
use crate::supervisor::{RenderProcess, UploadProcess};
use crate::task::{prepare_script, Phase, Role, Task, TaskId};

/// Fixed name of the render script inside the project directory.
pub const SCRIPT_NAME: &str = "go";

/// Task loop tuning.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Parent of the per-task output directories.
    pub work_dir: PathBuf,

    /// Where render scripts are written and run.
    pub project_dir: PathBuf,

    pub visibility_timeout: Duration,

    /// Poll ticks between visibility renewals.
    pub reassert_ticks: u32,

    pub poll_interval: Duration,

    /// Retry budget for whole sessions.
    pub retry: RetryPolicy,

    /// Retry budget for a single upload.
    pub upload_retry: RetryPolicy,

    /// Whether a failed render is redelivered (transient) or fatal.
    pub render_failure_retry: bool,
}

/// Owns the two task slots and drives them against the queue and store.
pub struct TaskRunner {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn ArtifactStore>,
    config: RunnerConfig,
    side_files: SideFiles,
    shutdown: watch::Receiver<bool>,
    active: Option<Task>,
    push: Option<Task>,
    last_task_id: u64,
    tasks_completed: u64,
}

impl TaskRunner {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn ArtifactStore>,
        config: RunnerConfig,
        side_files: SideFiles,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            side_files,
            shutdown,
            active: None,
            push: None,
            last_task_id: 0,
            tasks_completed: 0,
        }
    }

    /// Tasks fully rendered and uploaded since the runner was created.
    pub fn tasks_completed(&self) -> u64 {
        self.tasks_completed
    }

    /// Process tasks until the queue drains.
    ///
    /// Transient failures restart the session after the retry pause; fatal
    /// failures, an exhausted budget and cancellation are returned.
    pub async fn run(&mut self) -> Result<(), NodeError> {
        let executor = RetryExecutor::new(self.config.retry.clone());
        let mut attempts = executor.begin();
        let mut shutdown = self.shutdown.clone();

        loop {
            let result = self.session().await;
            self.cleanup_all().await;

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            tokio::select! {
                outcome = attempts.backoff(err) => outcome?,
                _ = cancelled(&mut shutdown) => return Err(NodeError::Interrupted),
            }
            info!(attempt = attempts.attempts(), "Restarting task loop");
        }
    }

    /// One pass of the loop, from a clean state until both slots are empty.
    async fn session(&mut self) -> Result<(), NodeError> {
        self.active = None;
        self.push = None;

        loop {
            self.check_cancelled()?;

            if let Some(message) = self.queue.read().await? {
                self.start_render(message).await?;
            }

            self.poll_until_idle().await?;

            if let Some(task) = self.push.take() {
                self.teardown(task, Role::Push).await;
            }

            if let Some(mut task) = self.active.take() {
                match task.output_dir.clone() {
                    Some(output_dir) => {
                        task.attach(Box::new(UploadProcess::start(
                            Arc::clone(&self.store),
                            output_dir,
                            RetryExecutor::new(self.config.upload_retry.clone()),
                        )));
                        info!(task_id = %task.id, "Task ready for push");
                        self.push = Some(task);
                    }
                    None => self.teardown(task, Role::Active).await,
                }
            }

            if self.active.is_none() && self.push.is_none() {
                return Ok(());
            }
        }
    }

    /// Turn a fresh delivery into the active task and start rendering it.
    async fn start_render(&mut self, message: Message) -> Result<(), NodeError> {
        self.last_task_id += 1;
        let id = TaskId(self.last_task_id);
        info!(task_id = %id, message_id = %message.id, "Received task");

        // Registered first so teardown releases the message if any step fails.
        let task = self.active.insert(Task::new(id, message));

        let output_dir = std::path::absolute(
            self.config
                .work_dir
                .join(format!("framefarm-outdir{id}.tmp")),
        )
        .map_err(|e| NodeError::io(&self.config.work_dir, e))?;
        remove_dir_if_present(&output_dir)?;
        std::fs::create_dir(&output_dir).map_err(|e| NodeError::io(&output_dir, e))?;
        task.output_dir = Some(output_dir.clone());

        let body = task
            .message
            .as_ref()
            .map(|m| m.body.as_str())
            .unwrap_or_default();
        let script = prepare_script(body, &output_dir);
        let script_path = std::path::absolute(self.config.project_dir.join(SCRIPT_NAME))
            .map_err(|e| NodeError::io(&self.config.project_dir, e))?;
        write_script(&script_path, &script)?;
        debug!(task_id = %id, script = %script, "Render script");

        let process = RenderProcess::spawn(&script_path, &self.config.project_dir).await?;
        task.attach(Box::new(process));
        Ok(())
    }

    /// Poll both slots until neither has a live process.
    async fn poll_until_idle(&mut self) -> Result<(), NodeError> {
        let mut ticks = 0;
        loop {
            let reassert = ticks >= self.config.reassert_ticks;
            for role in [Role::Active, Role::Push] {
                self.poll_slot(role, reassert).await?;
            }

            if !self.is_running(Role::Active) && !self.is_running(Role::Push) {
                return Ok(());
            }

            if reassert {
                ticks = 0;
            }
            self.tick().await?;
            ticks += 1;
        }
    }

    async fn poll_slot(&mut self, role: Role, reassert: bool) -> Result<(), NodeError> {
        let slot = match role {
            Role::Active => &mut self.active,
            Role::Push => &mut self.push,
        };
        let Some(task) = slot.as_mut() else {
            return Ok(());
        };
        let Phase::Running(process) = &mut task.phase else {
            return Ok(());
        };

        if let Some(code) = process.poll()? {
            task.phase = Phase::Exited(code);

            if code != 0 {
                warn!(task_id = %task.id, role = %role, exit_code = code, "Task process failed");
                return Err(match role {
                    Role::Active => NodeError::RenderFailed {
                        task_id: task.id,
                        exit_code: code,
                        retryable: self.config.render_failure_retry,
                    },
                    Role::Push => NodeError::UploadFailed {
                        task_id: task.id,
                        exit_code: code,
                    },
                });
            }

            match role {
                Role::Active => info!(task_id = %task.id, "Render finished"),
                Role::Push => {
                    if let Some(message) = &task.message {
                        self.queue.delete(message).await?;
                    }
                    task.message = None;
                    self.tasks_completed += 1;
                    info!(
                        task_id = %task.id,
                        tasks_completed = self.tasks_completed,
                        "Task pushed"
                    );
                    self.side_files.record(self.tasks_completed)?;
                }
            }
        }

        if reassert && task.is_running() {
            if let Some(message) = &task.message {
                debug!(task_id = %task.id, role = %role, "Renewing message visibility");
                self.queue
                    .change_visibility(message, self.config.visibility_timeout)
                    .await?;
            }
        }
        Ok(())
    }

    fn is_running(&self, role: Role) -> bool {
        let slot = match role {
            Role::Active => &self.active,
            Role::Push => &self.push,
        };
        slot.as_ref().is_some_and(Task::is_running)
    }

    /// Sleep one poll interval, waking early on cancellation.
    async fn tick(&self) -> Result<(), NodeError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => Ok(()),
            _ = cancelled(&mut shutdown) => Err(NodeError::Interrupted),
        }
    }

    fn check_cancelled(&self) -> Result<(), NodeError> {
        if *self.shutdown.borrow() {
            return Err(NodeError::Interrupted);
        }
        Ok(())
    }

    /// Tear down both slots.
    async fn cleanup_all(&mut self) {
        for (task, role) in [(self.active.take(), Role::Active), (self.push.take(), Role::Push)] {
            if let Some(task) = task {
                self.teardown(task, role).await;
            }
        }
    }

    /// Release everything `task` holds. Each step runs even if an earlier
    /// one failed; failures are logged and swallowed.
    async fn teardown(&self, mut task: Task, role: Role) {
        if let Some(message) = task.message.take() {
            if let Err(e) = self.queue.change_visibility(&message, Duration::ZERO).await {
                error!(task_id = %task.id, role = %role, error = %e, "Cleanup: failed to release message");
            }
        }

        if let Some(mut process) = task.take_process() {
            match process.stop().await {
                Ok(code) => debug!(task_id = %task.id, role = %role, exit_code = code, "Cleanup: stopped process"),
                Err(e) => error!(task_id = %task.id, role = %role, error = %e, "Cleanup: failed to stop process"),
            }
        }

        if let Some(dir) = task.output_dir.take() {
            if let Err(e) = remove_dir_if_present(&dir) {
                error!(task_id = %task.id, role = %role, error = %e, "Cleanup: failed to remove output directory");
            }
        }
    }
}

fn remove_dir_if_present(path: &Path) -> Result<(), NodeError> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(NodeError::io(path, e)),
        _ => Ok(()),
    }
}

fn write_script(path: &Path, script: &str) -> Result<(), NodeError> {
    use std::os::unix::fs::PermissionsExt;

    write_atomic(path, script)?;
    let mut permissions = std::fs::metadata(path)
        .map_err(|e| NodeError::io(path, e))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions).map_err(|e| NodeError::io(path, e))
}
