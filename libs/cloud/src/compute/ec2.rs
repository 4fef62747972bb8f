//! Amazon EC2 compute backend.

use async_trait::async_trait;
use aws_sdk_ec2::types::{InstanceType, RequestSpotLaunchSpecification, SpotInstanceType};
use aws_sdk_ec2::Client;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{Compute, InstanceInfo, LaunchSpec, SpotPrice, SpotRequestInfo, SpotSpec};
use crate::aws::{from_sdk, load_config};
use crate::error::CloudError;

const SERVICE: &str = "ec2";

/// EC2-backed fleet control.
#[derive(Debug, Clone)]
pub struct Ec2Compute {
    client: Client,
}

impl Ec2Compute {
    pub async fn connect(region: Option<&str>) -> Self {
        Self {
            client: Client::new(&load_config(region).await),
        }
    }
}

fn to_chrono(ts: Option<&aws_sdk_ec2::primitives::DateTime>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

fn optional_groups(groups: &[String]) -> Option<Vec<String>> {
    (!groups.is_empty()).then(|| groups.to_vec())
}

#[async_trait]
impl Compute for Ec2Compute {
    async fn launch_on_demand(&self, spec: &LaunchSpec) -> Result<Vec<String>, CloudError> {
        let count = i32::try_from(spec.count).unwrap_or(i32::MAX);
        let output = self
            .client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(count)
            .set_user_data(spec.user_data.as_ref().map(|s| BASE64.encode(s)))
            .set_key_name(spec.key_name.clone())
            .set_security_groups(optional_groups(&spec.security_groups))
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        let ids: Vec<String> = output
            .instances()
            .iter()
            .filter_map(|i| i.instance_id().map(str::to_string))
            .collect();
        info!(count = ids.len(), "Launched on-demand instances");
        Ok(ids)
    }

    async fn request_spot(&self, spec: &SpotSpec) -> Result<Vec<String>, CloudError> {
        let launch = &spec.launch;
        let launch_spec = RequestSpotLaunchSpecification::builder()
            .image_id(&launch.image_id)
            .instance_type(InstanceType::from(launch.instance_type.as_str()))
            .set_user_data(launch.user_data.as_ref().map(|s| BASE64.encode(s)))
            .set_key_name(launch.key_name.clone())
            .set_security_groups(optional_groups(&launch.security_groups))
            .build();
        let request_type = if spec.persistent {
            SpotInstanceType::Persistent
        } else {
            SpotInstanceType::OneTime
        };

        let output = self
            .client
            .request_spot_instances()
            .spot_price(&spec.price)
            .instance_count(i32::try_from(launch.count).unwrap_or(i32::MAX))
            .r#type(request_type)
            .launch_specification(launch_spec)
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        let ids: Vec<String> = output
            .spot_instance_requests()
            .iter()
            .filter_map(|r| r.spot_instance_request_id().map(str::to_string))
            .collect();
        info!(count = ids.len(), price = %spec.price, "Placed spot requests");
        Ok(ids)
    }

    async fn spot_price_history(
        &self,
        instance_type: &str,
    ) -> Result<Vec<SpotPrice>, CloudError> {
        let output = self
            .client
            .describe_spot_price_history()
            .instance_types(InstanceType::from(instance_type))
            .product_descriptions("Linux/UNIX")
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        Ok(output
            .spot_price_history()
            .iter()
            .filter_map(|p| {
                Some(SpotPrice {
                    availability_zone: p.availability_zone()?.to_string(),
                    timestamp: to_chrono(p.timestamp())?,
                    price: p.spot_price()?.to_string(),
                })
            })
            .collect())
    }

    async fn instances(&self) -> Result<Vec<InstanceInfo>, CloudError> {
        let mut pages = self.client.describe_instances().into_paginator().send();
        let mut instances = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| from_sdk(SERVICE, e))?;
            for instance in page.reservations().iter().flat_map(|r| r.instances()) {
                let Some(launch_time) = to_chrono(instance.launch_time()) else {
                    continue;
                };
                instances.push(InstanceInfo {
                    id: instance.instance_id().unwrap_or_default().to_string(),
                    image_id: instance.image_id().unwrap_or_default().to_string(),
                    public_dns_name: instance.public_dns_name().unwrap_or_default().to_string(),
                    launch_time,
                    state: instance
                        .state()
                        .and_then(|s| s.name())
                        .map(|n| n.as_str().to_string())
                        .unwrap_or_default(),
                });
            }
        }
        Ok(instances)
    }

    async fn stop_instances(&self, ids: &[String], terminate: bool) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        if terminate {
            self.client
                .terminate_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| from_sdk(SERVICE, e))?;
        } else {
            self.client
                .stop_instances()
                .set_instance_ids(Some(ids.to_vec()))
                .send()
                .await
                .map_err(|e| from_sdk(SERVICE, e))?;
        }
        Ok(())
    }

    async fn spot_requests(&self) -> Result<Vec<SpotRequestInfo>, CloudError> {
        let output = self
            .client
            .describe_spot_instance_requests()
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;

        Ok(output
            .spot_instance_requests()
            .iter()
            .map(|r| SpotRequestInfo {
                id: r.spot_instance_request_id().unwrap_or_default().to_string(),
                request_type: r.r#type().map(|t| t.as_str().to_string()).unwrap_or_default(),
                create_time: to_chrono(r.create_time()),
                price: r.spot_price().unwrap_or_default().to_string(),
                state: r.state().map(|s| s.as_str().to_string()).unwrap_or_default(),
                status: r
                    .status()
                    .and_then(|s| s.code())
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .cancel_spot_instance_requests()
            .set_spot_instance_request_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| from_sdk(SERVICE, e))?;
        Ok(())
    }
}
