//! Artifact store interface.
//!
//! Stores receive rendered output (`upload`) and serve project bundles
//! (`fetch_parallel`). Fetches are conditional on an ETag: when the remote
//! object still carries the caller's ETag nothing is transferred and
//! [`FetchOutcome::Unchanged`] is returned.

mod local;
mod memory;
#[cfg(feature = "aws")]
mod s3;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::CloudError;
use crate::url::StoreLocation;

pub use local::LocalStore;
pub use memory::MemoryStore;
#[cfg(feature = "aws")]
pub use s3::S3Store;

/// Result of a conditional fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The object was written to the local path.
    Downloaded { len: u64, etag: String },

    /// The remote ETag matched; the local path was not touched.
    Unchanged,
}

/// Store tuning shared by all backends.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Concurrent ranges for a parallel fetch.
    pub max_threads: usize,

    /// Attempts per range before a fetch fails.
    pub n_retries: u32,

    /// Region override for hosted stores.
    pub region: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_threads: 16,
            n_retries: 4,
            region: None,
        }
    }
}

/// Remote storage for render output and project bundles.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the file at `local_path` under `remote_name`.
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<(), CloudError>;

    /// Download `remote_url` to `local_path` unless its ETag equals `etag`.
    async fn fetch_parallel(
        &self,
        remote_url: &str,
        local_path: &Path,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CloudError>;

    /// URL an uploaded object ends up at.
    fn url_for(&self, remote_name: &str) -> String;

    /// Verify the store is reachable and writable enough to start work.
    async fn check(&self) -> Result<(), CloudError>;
}

/// Open the store at `url`.
pub async fn open_store(
    url: &str,
    options: &StoreOptions,
) -> Result<Arc<dyn ArtifactStore>, CloudError> {
    open_location(StoreLocation::parse(url)?, options).await
}

/// Open an already parsed store location.
pub async fn open_location(
    location: StoreLocation,
    options: &StoreOptions,
) -> Result<Arc<dyn ArtifactStore>, CloudError> {
    match location {
        StoreLocation::Local(root) => Ok(Arc::new(LocalStore::new(root))),
        #[cfg(feature = "aws")]
        StoreLocation::S3 { bucket, prefix } => {
            Ok(Arc::new(S3Store::connect(bucket, prefix, options).await))
        }
        #[cfg(not(feature = "aws"))]
        StoreLocation::S3 { .. } => {
            let _ = options;
            Err(CloudError::Unsupported("s3"))
        }
    }
}

/// Content fingerprint used by the local and in-memory stores.
pub fn content_etag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Object names must stay below the store root.
pub(crate) fn check_remote_name(remote_name: &str) -> Result<(), CloudError> {
    let escapes = remote_name.is_empty()
        || remote_name.starts_with('/')
        || remote_name.split('/').any(|part| part == "..");
    if escapes {
        return Err(CloudError::Rejected {
            service: "store",
            message: format!("invalid object name {remote_name:?}"),
        });
    }
    Ok(())
}
