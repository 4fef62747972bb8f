//! In-process store with failure injection, for tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{check_remote_name, content_etag, ArtifactStore, FetchOutcome};
use crate::error::CloudError;

const SCHEME: &str = "memory://";

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    uploads: u32,
    failing_uploads: u32,
    rejecting_uploads: bool,
    upload_delay: Duration,
}

/// Store held in memory. Objects are addressed as `memory://NAME`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seed an object.
    pub fn put(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.state().objects.insert(name.to_string(), bytes.into());
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.state().objects.get(name).cloned()
    }

    /// Names of every stored object, sorted.
    pub fn names(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Upload calls made so far, failed ones included.
    pub fn upload_calls(&self) -> u32 {
        self.state().uploads
    }

    /// Make the next `n` uploads fail with a transport error.
    pub fn fail_next_uploads(&self, n: u32) {
        self.state().failing_uploads = n;
    }

    /// Make every upload fail with a non-retryable rejection.
    pub fn reject_uploads(&self, reject: bool) {
        self.state().rejecting_uploads = reject;
    }

    /// Delay every upload, to keep an upload in flight across polls.
    pub fn set_upload_delay(&self, delay: Duration) {
        self.state().upload_delay = delay;
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<(), CloudError> {
        check_remote_name(remote_name)?;
        let delay = {
            let mut state = self.state();
            state.uploads += 1;
            if state.rejecting_uploads {
                return Err(CloudError::Rejected {
                    service: "memory-store",
                    message: format!("upload of {remote_name} refused"),
                });
            }
            if state.failing_uploads > 0 {
                state.failing_uploads -= 1;
                return Err(CloudError::Transport {
                    service: "memory-store",
                    message: "injected upload failure".to_string(),
                });
            }
            state.upload_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| CloudError::io(local_path, e))?;
        self.put(remote_name, bytes);
        Ok(())
    }

    async fn fetch_parallel(
        &self,
        remote_url: &str,
        local_path: &Path,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CloudError> {
        let name = remote_url
            .strip_prefix(SCHEME)
            .ok_or_else(|| CloudError::invalid_url(remote_url, "expected memory://NAME"))?;
        let bytes = self
            .object(name)
            .ok_or_else(|| CloudError::NotFound(remote_url.to_string()))?;

        let current = content_etag(&bytes);
        if etag == Some(current.as_str()) {
            return Ok(FetchOutcome::Unchanged);
        }

        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(|e| CloudError::io(local_path, e))?;
        Ok(FetchOutcome::Downloaded {
            len: bytes.len() as u64,
            etag: current,
        })
    }

    fn url_for(&self, remote_name: &str) -> String {
        format!("{SCHEME}{remote_name}")
    }

    async fn check(&self) -> Result<(), CloudError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_failure_injection() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.png");
        std::fs::write(&src, b"a").unwrap();

        let store = MemoryStore::new();
        store.fail_next_uploads(1);
        assert!(store.upload(&src, "a.png").await.is_err());
        store.upload(&src, "a.png").await.unwrap();

        assert_eq!(store.upload_calls(), 2);
        assert_eq!(store.object("a.png").as_deref(), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn test_fetch_by_etag() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store.put("proj.tar", b"tarball".to_vec());

        let dest = dir.path().join("proj.tar");
        let outcome = store
            .fetch_parallel("memory://proj.tar", &dest, None)
            .await
            .unwrap();
        let FetchOutcome::Downloaded { etag, .. } = outcome else {
            panic!("expected download");
        };
        let again = store
            .fetch_parallel("memory://proj.tar", &dest, Some(&etag))
            .await
            .unwrap();
        assert_eq!(again, FetchOutcome::Unchanged);
    }
}
