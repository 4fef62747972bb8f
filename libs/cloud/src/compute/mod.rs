//! Virtual-machine lifecycle interface used by the fleet commands.

mod memory;
#[cfg(feature = "aws")]
mod ec2;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CloudError;

pub use memory::MemoryCompute;
#[cfg(feature = "aws")]
pub use ec2::Ec2Compute;

/// Parameters for launching instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub count: u32,

    /// Boot script; `None` launches idle instances.
    pub user_data: Option<String>,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
}

/// A spot bid on top of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotSpec {
    pub launch: LaunchSpec,

    /// Maximum hourly price, as the provider spells it (`"0.05"`).
    pub price: String,

    /// Keep re-launching after interruption instead of a one-time request.
    pub persistent: bool,
}

/// One point of spot-price history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpotPrice {
    pub availability_zone: String,
    pub timestamp: DateTime<Utc>,
    pub price: String,
}

/// A running (or stopped) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub id: String,
    pub image_id: String,
    pub public_dns_name: String,
    pub launch_time: DateTime<Utc>,
    pub state: String,
}

impl InstanceInfo {
    /// Seconds since launch.
    pub fn uptime_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.launch_time).num_seconds().max(0)
    }
}

/// An open or historical spot request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpotRequestInfo {
    pub id: String,
    pub request_type: String,
    pub create_time: Option<DateTime<Utc>>,
    pub price: String,
    pub state: String,
    pub status: String,
}

/// Instance fleet control.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Launch on-demand instances; returns their ids.
    async fn launch_on_demand(&self, spec: &LaunchSpec) -> Result<Vec<String>, CloudError>;

    /// Place a spot bid; returns the request ids.
    async fn request_spot(&self, spec: &SpotSpec) -> Result<Vec<String>, CloudError>;

    /// Linux spot-price history for `instance_type`.
    async fn spot_price_history(&self, instance_type: &str)
        -> Result<Vec<SpotPrice>, CloudError>;

    async fn instances(&self) -> Result<Vec<InstanceInfo>, CloudError>;

    /// Stop, or terminate, the given instances.
    async fn stop_instances(&self, ids: &[String], terminate: bool) -> Result<(), CloudError>;

    async fn spot_requests(&self) -> Result<Vec<SpotRequestInfo>, CloudError>;

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError>;
}
