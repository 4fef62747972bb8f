//! Work queue interface.
//!
//! A work queue holds task scripts. Reading a message hides it from other
//! consumers for the visibility timeout; the consumer must either delete it
//! (commit) or keep renewing the timeout while it works. A message whose
//! timeout lapses is delivered again.

mod dir;
mod memory;
#[cfg(feature = "aws")]
mod sqs;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CloudError;
use crate::url::QueueLocation;

pub use dir::DirQueue;
pub use memory::MemoryQueue;
#[cfg(feature = "aws")]
pub use sqs::SqsQueue;

/// One delivery of a queued task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable message identifier.
    pub id: String,

    /// Opaque handle for this delivery; carries visibility and delete rights.
    pub receipt: String,

    /// Task script text.
    pub body: String,
}

/// Queue tuning shared by all backends.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Visibility timeout applied on read and on queue creation.
    pub visibility_timeout: Duration,

    /// Region override for hosted queues.
    pub region: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(120),
            region: None,
        }
    }
}

/// Durable visibility-timeout FIFO.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Take the next visible message, if any. Never blocks waiting for work.
    async fn read(&self) -> Result<Option<Message>, CloudError>;

    /// Hide `message` for `timeout` from now. Zero returns it to the pool.
    async fn change_visibility(
        &self,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), CloudError>;

    /// Commit: remove `message` for good.
    async fn delete(&self, message: &Message) -> Result<(), CloudError>;

    /// Enqueue a new task script.
    async fn push(&self, body: &str) -> Result<(), CloudError>;

    /// Approximate number of queued messages.
    async fn count(&self) -> Result<u64, CloudError>;

    /// Drop every message but keep the queue.
    async fn clear(&self) -> Result<(), CloudError>;

    /// Delete the queue itself.
    async fn destroy(&self) -> Result<(), CloudError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Open an existing queue.
pub async fn open_queue(
    url: &str,
    options: &QueueOptions,
) -> Result<Arc<dyn WorkQueue>, CloudError> {
    match QueueLocation::parse(url)? {
        QueueLocation::Dir(path) => Ok(Arc::new(DirQueue::open(path, options.visibility_timeout)?)),
        #[cfg(feature = "aws")]
        QueueLocation::Sqs { name } => Ok(Arc::new(SqsQueue::open(&name, options).await?)),
        #[cfg(not(feature = "aws"))]
        QueueLocation::Sqs { .. } => Err(CloudError::Unsupported("sqs")),
    }
}

/// Open a queue, creating it first if needed.
pub async fn create_queue(
    url: &str,
    options: &QueueOptions,
) -> Result<Arc<dyn WorkQueue>, CloudError> {
    match QueueLocation::parse(url)? {
        QueueLocation::Dir(path) => Ok(Arc::new(
            DirQueue::create(path, options.visibility_timeout).await?,
        )),
        #[cfg(feature = "aws")]
        QueueLocation::Sqs { name } => Ok(Arc::new(SqsQueue::create(&name, options).await?)),
        #[cfg(not(feature = "aws"))]
        QueueLocation::Sqs { .. } => Err(CloudError::Unsupported("sqs")),
    }
}
