//! Instance selection shared by the fleet and tool commands.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use framefarm_cloud::{Compute, InstanceInfo};
use framefarm_config::Settings;
use framefarm_retry::RetryExecutor;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::format_uptime;

/// Instance selection flags.
#[derive(Debug, Clone, Default, Args)]
pub struct FilterArgs {
    /// Only instances whose minute within the current uptime hour is at
    /// least this (billing-hour aware pruning).
    #[arg(long, short = 't', default_value_t = 0)]
    pub threshold: i64,

    /// Only instances running this image (default: AMI_ID setting).
    #[arg(long)]
    pub ami: Option<String>,

    /// Only this host (public DNS name).
    #[arg(long, conflicts_with = "hosts_file")]
    pub host: Option<String>,

    /// Only hosts listed in this file, one per line.
    #[arg(long)]
    pub hosts_file: Option<PathBuf>,
}

/// Resolved instance predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub threshold: i64,
    pub ami: Option<String>,
    pub hosts: Option<HashSet<String>>,
}

impl InstanceFilter {
    pub fn from_args(args: &FilterArgs, settings: &Settings) -> Result<Self> {
        let hosts = match (&args.hosts_file, &args.host) {
            (Some(path), _) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read hosts file {}", path.display()))?;
                Some(
                    text.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            (None, Some(host)) => Some(HashSet::from([host.clone()])),
            (None, None) => None,
        };

        Ok(Self {
            threshold: args.threshold,
            ami: args
                .ami
                .clone()
                .or_else(|| settings.get("AMI_ID").map(str::to_string)),
            hosts,
        })
    }

    fn matches(&self, instance: &InstanceInfo, now: DateTime<Utc>) -> bool {
        !instance.image_id.is_empty()
            && !instance.public_dns_name.is_empty()
            && (instance.uptime_secs(now) / 60) % 60 >= self.threshold
            && self.ami.as_ref().is_none_or(|ami| *ami == instance.image_id)
            && self
                .hosts
                .as_ref()
                .is_none_or(|hosts| hosts.contains(&instance.public_dns_name))
    }

    /// Matching instances ordered by image, launch time and DNS name.
    pub fn apply(&self, instances: Vec<InstanceInfo>, now: DateTime<Utc>) -> Vec<InstanceInfo> {
        let mut selected: Vec<_> = instances
            .into_iter()
            .filter(|i| self.matches(i, now))
            .collect();
        selected.sort_by(|a, b| {
            (&a.image_id, a.launch_time, &a.public_dns_name).cmp(&(
                &b.image_id,
                b.launch_time,
                &b.public_dns_name,
            ))
        });
        selected
    }

    /// Fetch the provider's instances and apply the filter.
    pub async fn select(
        &self,
        compute: &dyn Compute,
        retry: &RetryExecutor,
    ) -> Result<Vec<InstanceInfo>, CliError> {
        let instances = retry.run(|| compute.instances()).await?;
        Ok(self.apply(instances, Utc::now()))
    }
}

/// Table row for an instance listing.
#[derive(Debug, Tabled)]
pub struct InstanceRow {
    #[tabled(rename = "ID")]
    pub id: String,

    #[tabled(rename = "Image")]
    pub image_id: String,

    #[tabled(rename = "Uptime")]
    pub uptime: String,

    #[tabled(rename = "Host")]
    pub host: String,
}

impl InstanceRow {
    pub fn new(instance: &InstanceInfo, now: DateTime<Utc>) -> Self {
        Self {
            id: instance.id.clone(),
            image_id: instance.image_id.clone(),
            uptime: format_uptime(instance.uptime_secs(now)),
            host: instance.public_dns_name.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Duration;

    use super::*;

    pub(crate) fn instance(id: &str, image: &str, dns: &str, uptime_min: i64, now: DateTime<Utc>) -> InstanceInfo {
        InstanceInfo {
            id: id.to_string(),
            image_id: image.to_string(),
            public_dns_name: dns.to_string(),
            launch_time: now - Duration::minutes(uptime_min),
            state: "running".to_string(),
        }
    }

    #[test]
    fn test_threshold_uses_minute_of_hour() {
        let now = Utc::now();
        let filter = InstanceFilter {
            threshold: 45,
            ..Default::default()
        };
        let selected = filter.apply(
            vec![
                instance("i-1", "ami-1", "a", 50, now),
                instance("i-2", "ami-1", "b", 70, now),
                instance("i-3", "ami-1", "c", 110, now),
            ],
            now,
        );
        let ids: Vec<_> = selected.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["i-1", "i-3"]);
    }

    #[test]
    fn test_ami_and_hosts() {
        let now = Utc::now();
        let filter = InstanceFilter {
            threshold: 0,
            ami: Some("ami-1".to_string()),
            hosts: Some(HashSet::from(["a".to_string(), "c".to_string()])),
        };
        let selected = filter.apply(
            vec![
                instance("i-1", "ami-1", "a", 5, now),
                instance("i-2", "ami-1", "b", 5, now),
                instance("i-3", "ami-2", "c", 5, now),
                instance("i-4", "ami-1", "", 5, now),
            ],
            now,
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "i-1");
    }

    #[test]
    fn test_sorted_by_image_launch_dns() {
        let now = Utc::now();
        let selected = InstanceFilter::default().apply(
            vec![
                instance("i-1", "ami-2", "a", 5, now),
                instance("i-2", "ami-1", "z", 10, now),
                instance("i-3", "ami-1", "b", 10, now),
                instance("i-4", "ami-1", "a", 20, now),
            ],
            now,
        );
        let ids: Vec<_> = selected.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["i-4", "i-3", "i-2", "i-1"]);
    }

    #[test]
    fn test_hosts_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "a.example\n\n  b.example \n").unwrap();
        let args = FilterArgs {
            hosts_file: Some(path),
            ..Default::default()
        };
        let filter = InstanceFilter::from_args(&args, &Settings::new()).unwrap();
        assert_eq!(
            filter.hosts,
            Some(HashSet::from(["a.example".to_string(), "b.example".to_string()]))
        );
        assert_eq!(filter.ami, None);
    }
}
