//! Termination signals.
//!
//! Signals never run cleanup themselves. They flip the shared cancellation
//! flag; the task loop notices it on its next check or poll tick and tears
//! down through the normal path.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::NodeError;

/// Install SIGINT, SIGTERM and SIGHUP listeners that set `shutdown` to true.
pub fn spawn_listener(shutdown: watch::Sender<bool>) -> Result<JoinHandle<()>, NodeError> {
    let register = |kind: SignalKind| signal(kind).map_err(|e| NodeError::io("signal handler", e));
    let mut interrupt = register(SignalKind::interrupt())?;
    let mut terminate = register(SignalKind::terminate())?;
    let mut hangup = register(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = hangup.recv() => "SIGHUP",
            };

            if *shutdown.borrow() {
                warn!(signal = name, "Already shutting down");
                continue;
            }
            info!(signal = name, "Received termination signal, cleaning up");
            if shutdown.send(true).is_err() {
                return;
            }
        }
    }))
}

/// Resolves once cancellation has been requested; never if the sender is gone.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::sys::signal::{raise, Signal};

    use super::*;

    #[tokio::test]
    async fn test_signal_sets_flag() {
        let (tx, mut rx) = watch::channel(false);
        let handle = spawn_listener(tx).unwrap();

        raise(Signal::SIGHUP).unwrap();
        tokio::time::timeout(Duration::from_secs(5), cancelled(&mut rx))
            .await
            .unwrap();
        assert!(*rx.borrow());
        handle.abort();
    }

    #[tokio::test]
    async fn test_cancelled_pending_without_request() {
        let (tx, mut rx) = watch::channel(false);
        let waited = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(waited.is_err());

        drop(tx);
        let waited = tokio::time::timeout(Duration::from_millis(50), cancelled(&mut rx)).await;
        assert!(waited.is_err());
    }
}
