//! Filesystem store for single-host farms and development.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{check_remote_name, content_etag, ArtifactStore, FetchOutcome};
use crate::error::CloudError;
use crate::url::ObjectLocation;

/// Store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Copy `from` to `to` through a temporary sibling.
async fn copy_atomic(from: &Path, to: &Path) -> Result<u64, CloudError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CloudError::io(parent, e))?;
    }
    let mut tmp = to.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    let len = tokio::fs::copy(from, &tmp)
        .await
        .map_err(|e| CloudError::io(from, e))?;
    tokio::fs::rename(&tmp, to)
        .await
        .map_err(|e| CloudError::io(to, e))?;
    Ok(len)
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<(), CloudError> {
        check_remote_name(remote_name)?;
        let dest = self.root.join(remote_name);
        let len = copy_atomic(local_path, &dest).await?;
        debug!(src = %local_path.display(), dest = %dest.display(), bytes = len, "Stored object");
        Ok(())
    }

    async fn fetch_parallel(
        &self,
        remote_url: &str,
        local_path: &Path,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CloudError> {
        let source = match ObjectLocation::parse(remote_url)? {
            ObjectLocation::Local(path) => path,
            ObjectLocation::S3 { .. } => {
                return Err(CloudError::invalid_url(
                    remote_url,
                    "a file:// store cannot fetch s3:// objects",
                ))
            }
        };

        let bytes = match tokio::fs::read(&source).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CloudError::NotFound(remote_url.to_string()))
            }
            Err(e) => return Err(CloudError::io(&source, e)),
        };

        let current = content_etag(&bytes);
        if etag == Some(current.as_str()) {
            debug!(url = %remote_url, etag = %current, "Object unchanged");
            return Ok(FetchOutcome::Unchanged);
        }

        let len = copy_atomic(&source, local_path).await?;
        Ok(FetchOutcome::Downloaded { len, etag: current })
    }

    fn url_for(&self, remote_name: &str) -> String {
        format!("file://{}", self.root.join(remote_name).display())
    }

    async fn check(&self) -> Result<(), CloudError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CloudError::io(&self.root, e))?;
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| CloudError::io(&self.root, e))?;
        if meta.permissions().readonly() {
            return Err(CloudError::Rejected {
                service: "store",
                message: format!("{} is read-only", self.root.display()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_nested_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("frame.png");
        std::fs::write(&src, b"pixels").unwrap();

        let store = LocalStore::new(dir.path().join("out"));
        store.check().await.unwrap();
        store.upload(&src, "beauty/frame.png").await.unwrap();

        let stored = std::fs::read(dir.path().join("out/beauty/frame.png")).unwrap();
        assert_eq!(stored, b"pixels");
        assert!(!dir.path().join("out/beauty/frame.png.part").exists());
    }

    #[tokio::test]
    async fn test_upload_rejects_escaping_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("frame.png");
        std::fs::write(&src, b"pixels").unwrap();

        let store = LocalStore::new(dir.path().join("out"));
        assert!(store.upload(&src, "../frame.png").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_honours_etag() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("proj.tar");
        std::fs::write(&archive, b"archive-v1").unwrap();
        let url = format!("file://{}", archive.display());
        let dest = dir.path().join("dl/proj.tar");

        let store = LocalStore::new(dir.path());
        let first = store.fetch_parallel(&url, &dest, None).await.unwrap();
        let FetchOutcome::Downloaded { len, etag } = first else {
            panic!("expected download, got {first:?}");
        };
        assert_eq!(len, 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive-v1");

        let second = store.fetch_parallel(&url, &dest, Some(&etag)).await.unwrap();
        assert_eq!(second, FetchOutcome::Unchanged);

        std::fs::write(&archive, b"archive-v2").unwrap();
        let third = store.fetch_parallel(&url, &dest, Some(&etag)).await.unwrap();
        assert!(matches!(third, FetchOutcome::Downloaded { .. }));
    }

    #[tokio::test]
    async fn test_fetch_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let url = format!("file://{}", dir.path().join("nope.zip").display());
        let result = store
            .fetch_parallel(&url, &dir.path().join("x"), None)
            .await;
        assert!(matches!(result, Err(CloudError::NotFound(_))));
    }
}
