//! Spool-directory queue for single-host farms and local development.
//!
//! Layout under the spool root:
//!
//! - `<ulid>.task`: message body
//! - `<ulid>.lease`: JSON `{ "visible_at_ms": .., "receipt": .. }`, absent
//!   until the message is first read
//! - `.lock`: `flock` target serializing every lease read-modify-write,
//!   across processes as well as across queue handles
//!
//! Files are written to a uniquely named `.tmp` sibling and renamed into
//! place, so readers never observe a half-written message or lease.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::debug;
use ulid::{Generator, Ulid};

use super::{Message, WorkQueue};
use crate::error::CloudError;

const TASK_EXT: &str = "task";
const LEASE_EXT: &str = "lease";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
struct Lease {
    visible_at_ms: i64,
    receipt: String,
}

/// Spool paths and blocking file operations.
#[derive(Debug, Clone)]
struct Spool {
    root: PathBuf,
}

impl Spool {
    fn path(&self, id: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{id}.{ext}"))
    }

    /// Exclusive lock on the spool, released when the guard drops.
    fn lock(&self) -> Result<Flock<File>, CloudError> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| CloudError::io(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| CloudError::io(&path, io::Error::from(errno)))
    }

    /// Message ids in FIFO order.
    fn task_ids(&self) -> Result<Vec<String>, CloudError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| CloudError::io(&self.root, e))?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CloudError::io(&self.root, e))?.path();
            if path.extension().is_some_and(|e| e == TASK_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load_lease(&self, id: &str) -> Result<Option<Lease>, CloudError> {
        let path = self.path(id, LEASE_EXT);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CloudError::io(path, e)),
        }
    }

    fn store_lease(&self, id: &str, lease: &Lease) -> Result<(), CloudError> {
        let path = self.path(id, LEASE_EXT);
        let bytes = serde_json::to_vec(lease).map_err(|e| CloudError::io(&path, io::Error::other(e)))?;
        write_atomic(&path, &bytes)
    }

    /// Claim the oldest visible message. Caller holds the lock.
    fn claim(&self, visibility_timeout: Duration) -> Result<Option<Message>, CloudError> {
        let now = now_ms();
        for id in self.task_ids()? {
            let visible = self
                .load_lease(&id)?
                .is_none_or(|lease| lease.visible_at_ms <= now);
            if !visible {
                continue;
            }

            let body = match std::fs::read_to_string(self.path(&id, TASK_EXT)) {
                Ok(body) => body,
                // Deleted between listing and reading.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CloudError::io(self.path(&id, TASK_EXT), e)),
            };

            let receipt = Ulid::new().to_string();
            self.store_lease(
                &id,
                &Lease {
                    visible_at_ms: after_ms(visibility_timeout),
                    receipt: receipt.clone(),
                },
            )?;

            debug!(message_id = %id, "Claimed message from spool");
            return Ok(Some(Message { id, receipt, body }));
        }
        Ok(None)
    }

    /// Move the lease of a held message. Caller holds the lock.
    fn renew(&self, message: &Message, timeout: Duration) -> Result<(), CloudError> {
        if !self.path(&message.id, TASK_EXT).exists() {
            return Err(CloudError::NotFound(format!("message {}", message.id)));
        }
        if let Some(lease) = self.load_lease(&message.id)? {
            if lease.receipt != message.receipt {
                return Err(CloudError::Rejected {
                    service: "dir-queue",
                    message: format!("stale receipt for message {}", message.id),
                });
            }
        }
        self.store_lease(
            &message.id,
            &Lease {
                visible_at_ms: after_ms(timeout),
                receipt: message.receipt.clone(),
            },
        )
    }

    fn remove(&self, id: &str) -> Result<(), CloudError> {
        remove_if_present(&self.path(id, TASK_EXT))?;
        remove_if_present(&self.path(id, LEASE_EXT))
    }
}

/// Queue backed by a local directory.
pub struct DirQueue {
    spool: Spool,
    visibility_timeout: Duration,
    ids: Mutex<Generator>,
}

impl DirQueue {
    /// Open an existing spool directory.
    pub fn open(root: impl Into<PathBuf>, visibility_timeout: Duration) -> Result<Self, CloudError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CloudError::NotFound(format!(
                "queue directory {}",
                root.display()
            )));
        }
        Ok(Self::new(root, visibility_timeout))
    }

    /// Create the spool directory if needed.
    pub async fn create(
        root: impl Into<PathBuf>,
        visibility_timeout: Duration,
    ) -> Result<Self, CloudError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| CloudError::io(&root, e))?;
        Ok(Self::new(root, visibility_timeout))
    }

    fn new(root: PathBuf, visibility_timeout: Duration) -> Self {
        Self {
            spool: Spool { root },
            visibility_timeout,
            ids: Mutex::new(Generator::new()),
        }
    }

    fn next_id(&self) -> Ulid {
        let mut generator = match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        generator.generate().unwrap_or_else(|_| Ulid::new())
    }

    /// Run `op` on the blocking pool, optionally under the spool lock.
    async fn blocking<T, F>(&self, exclusive: bool, op: F) -> Result<T, CloudError>
    where
        T: Send + 'static,
        F: FnOnce(&Spool) -> Result<T, CloudError> + Send + 'static,
    {
        let spool = self.spool.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = if exclusive { Some(spool.lock()?) } else { None };
            op(&spool)
        })
        .await
        .map_err(|e| CloudError::io(&self.spool.root, io::Error::other(e)))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CloudError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(format!(".{}.tmp", Ulid::new()));
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes).map_err(|e| CloudError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        CloudError::io(path, e)
    })
}

fn remove_if_present(path: &Path) -> Result<(), CloudError> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(CloudError::io(path, e)),
        _ => Ok(()),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn after_ms(timeout: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl WorkQueue for DirQueue {
    async fn read(&self) -> Result<Option<Message>, CloudError> {
        let timeout = self.visibility_timeout;
        self.blocking(true, move |spool| spool.claim(timeout)).await
    }

    async fn change_visibility(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        let message = message.clone();
        self.blocking(true, move |spool| spool.renew(&message, timeout))
            .await
    }

    async fn delete(&self, message: &Message) -> Result<(), CloudError> {
        let id = message.id.clone();
        self.blocking(true, move |spool| spool.remove(&id)).await
    }

    async fn push(&self, body: &str) -> Result<(), CloudError> {
        let path = self.spool.path(&self.next_id().to_string(), TASK_EXT);
        let body = body.to_string();
        self.blocking(false, move |_| write_atomic(&path, body.as_bytes()))
            .await
    }

    async fn count(&self) -> Result<u64, CloudError> {
        let ids = self.blocking(false, |spool| spool.task_ids()).await?;
        Ok(ids.len() as u64)
    }

    async fn clear(&self) -> Result<(), CloudError> {
        self.blocking(true, |spool| {
            for id in spool.task_ids()? {
                spool.remove(&id)?;
            }
            Ok(())
        })
        .await
    }

    async fn destroy(&self) -> Result<(), CloudError> {
        tokio::fs::remove_dir_all(&self.spool.root)
            .await
            .map_err(|e| CloudError::io(&self.spool.root, e))
    }

    fn describe(&self) -> String {
        format!("dir://{}", self.spool.root.display())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn spool() -> (tempfile::TempDir, DirQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = DirQueue::create(dir.path().join("spool"), Duration::from_secs(120))
            .await
            .unwrap();
        (dir, queue)
    }

    #[tokio::test]
    async fn test_fifo_order_and_hiding() {
        let (_dir, queue) = spool().await;
        queue.push("first").await.unwrap();
        queue.push("second").await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 2);

        let a = queue.read().await.unwrap().unwrap();
        let b = queue.read().await.unwrap().unwrap();
        assert_eq!(a.body, "first");
        assert_eq!(b.body, "second");

        // Both are leased now.
        assert!(queue.read().await.unwrap().is_none());
        assert_eq!(queue.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zero_visibility_redelivers() {
        let (_dir, queue) = spool().await;
        queue.push("render").await.unwrap();

        let first = queue.read().await.unwrap().unwrap();
        queue
            .change_visibility(&first, Duration::ZERO)
            .await
            .unwrap();

        let again = queue.read().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_ne!(again.receipt, first.receipt);
    }

    #[tokio::test]
    async fn test_stale_receipt_rejected() {
        let (_dir, queue) = spool().await;
        queue.push("render").await.unwrap();

        let first = queue.read().await.unwrap().unwrap();
        queue.change_visibility(&first, Duration::ZERO).await.unwrap();
        let _second = queue.read().await.unwrap().unwrap();

        let result = queue
            .change_visibility(&first, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(CloudError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_dir, queue) = spool().await;
        queue.push("a").await.unwrap();
        queue.push("b").await.unwrap();

        let a = queue.read().await.unwrap().unwrap();
        queue.delete(&a).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 1);

        queue.clear().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);
        assert!(queue.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = DirQueue::open(dir.path().join("missing"), Duration::from_secs(1));
        assert!(matches!(result, Err(CloudError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_destroy_removes_spool() {
        let (dir, queue) = spool().await;
        queue.push("a").await.unwrap();
        queue.destroy().await.unwrap();
        assert!(!dir.path().join("spool").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_claim_once() {
        let (dir, queue) = spool().await;
        let root = dir.path().join("spool");
        let first = Arc::new(queue);
        let second = Arc::new(DirQueue::open(&root, Duration::from_secs(120)).unwrap());

        for round in 0..100 {
            first.push(&format!("task {round}")).await.unwrap();

            let a = tokio::spawn({
                let queue = Arc::clone(&first);
                async move { queue.read().await }
            });
            let b = tokio::spawn({
                let queue = Arc::clone(&second);
                async move { queue.read().await }
            });
            let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

            let claimed: Vec<Message> = a.into_iter().chain(b).collect();
            assert_eq!(claimed.len(), 1, "round {round}: {claimed:?}");
            first.delete(&claimed[0]).await.unwrap();
        }

        // No temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_renewals_do_not_collide() {
        let (_dir, queue) = spool().await;
        queue.push("render").await.unwrap();
        let queue = Arc::new(queue);
        let message = queue.read().await.unwrap().unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = Arc::clone(&queue);
            let message = message.clone();
            handles.push(tokio::spawn(async move {
                queue.change_visibility(&message, Duration::from_secs(60)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(queue.read().await.unwrap().is_none());
    }
}
