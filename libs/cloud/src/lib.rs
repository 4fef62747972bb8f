//! Cloud collaborators of the render farm.
//!
//! The farm talks to three external services, each behind a trait:
//!
//! - [`WorkQueue`]: durable FIFO with visibility-timeout semantics holding
//!   task scripts.
//! - [`ArtifactStore`]: remote storage for rendered output and project
//!   bundles.
//! - [`Compute`]: virtual-machine lifecycle for the fleet commands.
//!
//! Backends are picked from URLs:
//!
//! | URL | Backend |
//! |---|---|
//! | `dir:///spool` | [`DirQueue`] (local spool directory) |
//! | `file:///out` | [`LocalStore`] |
//! | `sqs://name` | `SqsQueue` (feature `aws`) |
//! | `s3://bucket/prefix` | `S3Store` (feature `aws`) |
//!
//! In-memory fakes ([`MemoryQueue`], [`MemoryStore`], [`MemoryCompute`])
//! are public so services can drive their loops in tests.

pub mod compute;
pub mod error;
pub mod queue;
pub mod store;
pub mod url;

#[cfg(feature = "aws")]
pub mod aws;

pub use compute::{
    Compute, InstanceInfo, LaunchSpec, MemoryCompute, SpotPrice, SpotRequestInfo, SpotSpec,
};
pub use error::CloudError;
pub use queue::{create_queue, open_queue, DirQueue, MemoryQueue, Message, QueueOptions, WorkQueue};
pub use store::{
    content_etag, open_location, open_store, ArtifactStore, FetchOutcome, LocalStore, MemoryStore,
    StoreOptions,
};
pub use url::{ObjectLocation, QueueLocation, StoreLocation};

#[cfg(feature = "aws")]
pub use compute::Ec2Compute;
#[cfg(feature = "aws")]
pub use queue::SqsQueue;
#[cfg(feature = "aws")]
pub use store::S3Store;
