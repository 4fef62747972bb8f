//! Amazon S3 artifact store.
//!
//! Uploads use the reduced-redundancy storage class: rendered frames can be
//! regenerated, so durability is traded for cost. Fetches split the object
//! into byte ranges downloaded concurrently and written in place. Every
//! range is pinned to the ETag seen by the initial HEAD, so a bundle
//! replaced mid-fetch fails the whole fetch with [`CloudError::Modified`]
//! instead of mixing bytes from two versions.

use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use framefarm_retry::{RetryExecutor, RetryPolicy};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{check_remote_name, ArtifactStore, FetchOutcome, StoreOptions};
use crate::aws::{from_sdk, load_config};
use crate::error::CloudError;
use crate::url::ObjectLocation;

const SERVICE: &str = "s3";

/// Ranges smaller than this are not worth a separate request.
const MIN_RANGE_BYTES: u64 = 1 << 20;

/// S3-backed store rooted at `bucket/prefix`.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    max_threads: usize,
    range_retry: RetryExecutor,
}

impl S3Store {
    pub async fn connect(bucket: String, prefix: String, options: &StoreOptions) -> Self {
        let client = Client::new(&load_config(options.region.as_deref()).await);
        Self {
            client,
            bucket,
            prefix,
            max_threads: options.max_threads.max(1),
            range_retry: RetryExecutor::new(RetryPolicy {
                max_attempts: options.n_retries.max(1),
                pause: Duration::from_secs(1),
                ..RetryPolicy::default()
            }),
        }
    }

    fn key_for(&self, remote_name: &str) -> String {
        format!("{}{}", self.prefix, remote_name)
    }
}

/// Split `len` bytes into at most `parts` inclusive ranges.
fn split_ranges(len: u64, parts: usize) -> Vec<(u64, u64)> {
    if len == 0 {
        return Vec::new();
    }
    let chunk = len.div_ceil(parts.max(1) as u64).max(MIN_RANGE_BYTES);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let end = (start + chunk).min(len) - 1;
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

fn strip_quotes(etag: &str) -> &str {
    etag.trim_matches('"')
}

/// One ranged read of a fetch.
#[derive(Debug, Clone)]
struct RangeRequest {
    client: Client,
    bucket: String,
    key: String,
    etag: String,
    file: Arc<std::fs::File>,
    path: PathBuf,
    range: (u64, u64),
}

async fn fetch_range(request: RangeRequest) -> Result<(), CloudError> {
    let RangeRequest {
        client,
        bucket,
        key,
        etag,
        file,
        path,
        range: (start, end),
    } = request;

    let mut get = client
        .get_object()
        .bucket(&bucket)
        .key(&key)
        .range(format!("bytes={start}-{end}"));
    if !etag.is_empty() {
        get = get.if_match(format!("\"{etag}\""));
    }
    let output = get
        .send()
        .await
        .map_err(|e| from_sdk(SERVICE, e))?;
    let bytes = output
        .body
        .collect()
        .await
        .map_err(|e| CloudError::Transport {
            service: SERVICE,
            message: e.to_string(),
        })?
        .into_bytes();

    if bytes.len() as u64 != end - start + 1 {
        return Err(CloudError::Transport {
            service: SERVICE,
            message: format!(
                "short read for bytes {start}-{end}: got {} bytes",
                bytes.len()
            ),
        });
    }

    tokio::task::spawn_blocking(move || file.write_all_at(&bytes, start))
        .await
        .map_err(|e| CloudError::io(&path, io::Error::other(e)))?
        .map_err(|e| CloudError::io(&path, e))
}

/// Retry one range on transient failures. A changed object ends the range
/// at once: retrying against a new version cannot succeed.
async fn retry_range<F, Fut>(retry: &RetryExecutor, mut fetch: F) -> Result<(), CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CloudError>>,
{
    let mut attempts = retry.begin();
    loop {
        match fetch().await {
            Ok(()) => return Ok(()),
            Err(e @ CloudError::Modified { .. }) => return Err(e),
            Err(e) => attempts.backoff(e).await.map_err(|e| e.into_inner())?,
        }
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<(), CloudError> {
        check_remote_name(remote_name)?;
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| CloudError::io(local_path, io::Error::other(e)))?;
        let key = self.key_for(remote_name);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .storage_class(StorageClass::ReducedRedundancy)
            .body(body)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        debug!(bucket = %self.bucket, key = %key, "Uploaded object");
        Ok(())
    }

    async fn fetch_parallel(
        &self,
        remote_url: &str,
        local_path: &Path,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, CloudError> {
        let (bucket, key) = match ObjectLocation::parse(remote_url)? {
            ObjectLocation::S3 { bucket, key } => (bucket, key),
            ObjectLocation::Local(_) => {
                return Err(CloudError::invalid_url(
                    remote_url,
                    "an s3:// store cannot fetch file:// objects",
                ))
            }
        };

        let head = self
            .client
            .head_object()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        let current = strip_quotes(head.e_tag().unwrap_or_default()).to_string();
        if !current.is_empty() && etag.map(strip_quotes) == Some(current.as_str()) {
            debug!(url = %remote_url, etag = %current, "Object unchanged");
            return Ok(FetchOutcome::Unchanged);
        }
        let len = u64::try_from(head.content_length().unwrap_or(0)).unwrap_or(0);

        let mut tmp = local_path.as_os_str().to_owned();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);
        let file = std::fs::File::create(&tmp).map_err(|e| CloudError::io(&tmp, e))?;
        file.set_len(len).map_err(|e| CloudError::io(&tmp, e))?;
        let file = Arc::new(file);

        let ranges = split_ranges(len, self.max_threads);
        info!(url = %remote_url, bytes = len, ranges = ranges.len(), "Fetching object");

        let mut jobs = JoinSet::new();
        for range in ranges {
            let retry = self.range_retry.clone();
            let request = RangeRequest {
                client: self.client.clone(),
                bucket: bucket.clone(),
                key: key.clone(),
                etag: current.clone(),
                file: Arc::clone(&file),
                path: tmp.clone(),
                range,
            };
            jobs.spawn(async move { retry_range(&retry, || fetch_range(request.clone())).await });
        }

        let mut failure = None;
        while let Some(joined) = jobs.join_next().await {
            let result = joined.map_err(|e| CloudError::io(&tmp, io::Error::other(e)));
            if let Err(e) = result.and_then(|r| r) {
                failure.get_or_insert(e);
                jobs.abort_all();
            }
        }
        if let Some(e) = failure {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        file.sync_all().map_err(|e| CloudError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, local_path)
            .await
            .map_err(|e| CloudError::io(local_path, e))?;

        Ok(FetchOutcome::Downloaded { len, etag: current })
    }

    fn url_for(&self, remote_name: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.key_for(remote_name))
    }

    async fn check(&self) -> Result<(), CloudError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ranges_covers_object() {
        let len = 10 * MIN_RANGE_BYTES + 7;
        let ranges = split_ranges(len, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, len - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn test_split_ranges_small_object() {
        assert_eq!(split_ranges(100, 16), vec![(0, 99)]);
        assert!(split_ranges(0, 16).is_empty());
    }

    #[tokio::test]
    async fn test_range_retries_transient_failures() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let retry = RetryExecutor::new(RetryPolicy::immediate(3));
        let result = retry_range(&retry, || async {
            if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Err(CloudError::Transport {
                    service: SERVICE,
                    message: "reset".to_string(),
                })
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_changed_object_ends_range_at_once() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let retry = RetryExecutor::new(RetryPolicy::immediate(5));
        let result = retry_range(&retry, || async {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(CloudError::Modified {
                service: SERVICE,
                message: "PreconditionFailed".to_string(),
            })
        })
        .await;
        // Surfaces as transient so the caller restarts the whole fetch.
        let err = result.unwrap_err();
        assert!(matches!(err, CloudError::Modified { .. }));
        assert!(framefarm_retry::Classify::class(&err).is_transient());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("abc"), "abc");
    }
}
