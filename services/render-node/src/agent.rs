//! Agent lifecycle: everything between parsed settings and process exit.
//!
//! ```text
//! check output store -> clear side files -> pid file -> fetch project
//!   -> open queue -> task loop -> completion marker
//!                        ^              |
//!                        +---- poll ----+
//! ```

use std::future::Future;
use std::time::Duration;

use framefarm_cloud::{open_queue, open_store};
use framefarm_retry::RetryExecutor;
use tokio::sync::watch;
use tracing::info;

use crate::completion::{read_marker, DoneMode};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::project::{get_project, ProjectSource};
use crate::runner::{RunnerConfig, TaskRunner};
use crate::sidefiles::{PidFile, SideFiles};
use crate::signals::cancelled;

/// How the agent finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentOutcome {
    pub tasks_completed: u64,

    /// The completion marker asked for the host to be powered off.
    pub power_off: bool,
}

/// Run the agent until the queue drains (or forever in poll mode).
///
/// `force_shutdown` overrides the completion marker with
/// [`DoneMode::Shutdown`]. Setting `shutdown` to true cancels the run; the
/// task loop tears down and [`NodeError::Interrupted`] is returned.
pub async fn run_agent(
    config: &NodeConfig,
    force_shutdown: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<AgentOutcome, NodeError> {
    let work_dir = &config.work_dir;
    std::fs::create_dir_all(work_dir).map_err(|e| NodeError::io(work_dir, e))?;
    let force_shutdown = force_shutdown || config.shutdown;

    let store = open_store(&config.render_output, &config.store_options()).await?;
    store.check().await?;
    info!(render_output = %config.render_output, "Output store ready");

    let side_files = SideFiles::new(work_dir);
    side_files.clear()?;
    let _pid_file = PidFile::create(work_dir)?;

    let retry = RetryExecutor::new(config.retry.clone());
    let source = ProjectSource {
        url: config.project.clone(),
        work_dir: work_dir.clone(),
        always_refetch: config.project_always_refetch,
        store: config.store_options(),
    };
    let project_dir = or_cancelled(get_project(&source, &retry), &mut shutdown).await?;
    info!(project_dir = %project_dir.display(), "Project ready");

    let queue_options = config.queue_options();
    let queue = or_cancelled(
        async {
            retry
                .run(|| open_queue(&config.work_queue, &queue_options))
                .await
                .map_err(NodeError::from)
        },
        &mut shutdown,
    )
    .await?;
    info!(queue = %queue.describe(), "Work queue opened");

    let mut runner = TaskRunner::new(
        queue,
        store,
        RunnerConfig {
            work_dir: work_dir.clone(),
            project_dir,
            visibility_timeout: config.visibility_timeout,
            reassert_ticks: config.reassert_ticks,
            poll_interval: config.poll_interval,
            retry: config.retry.clone(),
            upload_retry: config.retry.clone(),
            render_failure_retry: config.render_failure_retry,
        },
        side_files,
        shutdown.clone(),
    );

    let result = drain_rounds(&mut runner, config, force_shutdown, shutdown).await;
    info!(tasks_completed = runner.tasks_completed(), "Task loop finished");

    result.map(|power_off| AgentOutcome {
        tasks_completed: runner.tasks_completed(),
        power_off,
    })
}

/// Run the task loop until the completion marker says to stop. Returns
/// whether the host should be powered off.
async fn drain_rounds(
    runner: &mut TaskRunner,
    config: &NodeConfig,
    force_shutdown: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<bool, NodeError> {
    loop {
        runner.run().await?;

        match read_marker(&config.work_dir, config.done, force_shutdown) {
            DoneMode::Stop => return Ok(false),
            DoneMode::Shutdown => return Ok(true),
            DoneMode::Poll => {
                info!(
                    interval_secs = config.done_poll_interval.as_secs(),
                    "Queue drained, polling for more work"
                );
                wait(config.done_poll_interval, &mut shutdown).await?;
            }
        }
    }
}

/// Drive `work` unless cancellation arrives first.
async fn or_cancelled<T>(
    work: impl Future<Output = Result<T, NodeError>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<T, NodeError> {
    tokio::select! {
        biased;
        _ = cancelled(shutdown) => Err(NodeError::Interrupted),
        result = work => result,
    }
}

async fn wait(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<(), NodeError> {
    or_cancelled(
        async {
            tokio::time::sleep(duration).await;
            Ok(())
        },
        shutdown,
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use framefarm_config::Settings;

    use super::*;
    use crate::completion::DONE_FILE;
    use crate::sidefiles::{PID_FILE, TASK_COUNT_FILE};

    fn config(root: &Path, extra: &str) -> NodeConfig {
        let text = format!(
            "WORK_QUEUE=dir://{root}/spool\n\
             RENDER_OUTPUT=file://{root}/out\n\
             PROJECT=file://{root}/project\n\
             WORK_DIR={root}/work\n\
             POLL_INTERVAL_MS=20\n\
             ERROR_PAUSE=0\n\
             {extra}",
            root = root.display()
        );
        NodeConfig::from_settings(&Settings::parse_with(&text, |_| None)).unwrap()
    }

    fn setup(root: &Path) {
        std::fs::create_dir_all(root.join("spool")).unwrap();
        std::fs::create_dir_all(root.join("project")).unwrap();
    }

    #[tokio::test]
    async fn test_empty_queue_stops() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join(TASK_COUNT_FILE), "7\n").unwrap();

        let (_tx, rx) = watch::channel(false);
        let outcome = run_agent(&config(dir.path(), ""), false, rx).await.unwrap();
        assert_eq!(
            outcome,
            AgentOutcome {
                tasks_completed: 0,
                power_off: false
            }
        );
        // Stale accounting cleared, pid file removed on exit.
        assert!(!work.join(TASK_COUNT_FILE).exists());
        assert!(!work.join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn test_shutdown_forced() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let (_tx, rx) = watch::channel(false);
        let outcome = run_agent(&config(dir.path(), ""), true, rx).await.unwrap();
        assert!(outcome.power_off);

        let (_tx, rx) = watch::channel(false);
        let outcome = run_agent(&config(dir.path(), "SHUTDOWN=1\n"), false, rx)
            .await
            .unwrap();
        assert!(outcome.power_off);
    }

    #[tokio::test]
    async fn test_marker_file_wins_over_setting() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::write(work.join(DONE_FILE), "shutdown\n").unwrap();

        let (_tx, rx) = watch::channel(false);
        let outcome = run_agent(&config(dir.path(), "DONE=stop\n"), false, rx)
            .await
            .unwrap();
        assert!(outcome.power_off);
    }

    #[tokio::test]
    async fn test_poll_mode_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let (tx, rx) = watch::channel(false);
        let config = config(dir.path(), "DONE=poll\nDONE_POLL_INTERVAL=3600\n");
        let (result, _) = tokio::join!(run_agent(&config, false, rx), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });
        assert!(matches!(result, Err(NodeError::Interrupted)));
    }

    #[tokio::test]
    async fn test_cancelled_before_startup_finishes() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());

        let (tx, rx) = watch::channel(false);
        let _ = tx.send(true);
        let result = run_agent(&config(dir.path(), ""), false, rx).await;
        assert!(matches!(result, Err(NodeError::Interrupted)));
        assert!(!dir.path().join("work").join(PID_FILE).exists());
    }

    #[tokio::test]
    async fn test_stalled_startup_step_interrupted() {
        let (tx, mut rx) = watch::channel(false);
        let started = std::time::Instant::now();
        let (result, _) = tokio::join!(
            or_cancelled(std::future::pending::<Result<(), NodeError>>(), &mut rx),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(true);
            }
        );
        assert!(matches!(result, Err(NodeError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_project_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("spool")).unwrap();

        let (_tx, rx) = watch::channel(false);
        let result = run_agent(&config(dir.path(), ""), false, rx).await;
        assert!(matches!(result, Err(NodeError::Project(_))));
    }
}
