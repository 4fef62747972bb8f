//! In-process compute backend, for tests.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{Compute, InstanceInfo, LaunchSpec, SpotPrice, SpotRequestInfo, SpotSpec};
use crate::error::CloudError;

#[derive(Debug, Default)]
struct State {
    instances: Vec<InstanceInfo>,
    spot_requests: Vec<SpotRequestInfo>,
    prices: Vec<SpotPrice>,
    launches: Vec<LaunchSpec>,
    bids: Vec<SpotSpec>,
    stopped: Vec<String>,
    terminated: Vec<String>,
    next_id: u64,
}

/// Compute backend that keeps its fleet in memory.
#[derive(Debug, Default)]
pub struct MemoryCompute {
    state: Mutex<State>,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_instance(&self, instance: InstanceInfo) {
        self.state().instances.push(instance);
    }

    pub fn add_spot_request(&self, request: SpotRequestInfo) {
        self.state().spot_requests.push(request);
    }

    pub fn add_price(&self, price: SpotPrice) {
        self.state().prices.push(price);
    }

    /// Every on-demand launch requested so far.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state().launches.clone()
    }

    /// Every spot bid placed so far.
    pub fn bids(&self) -> Vec<SpotSpec> {
        self.state().bids.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }
}

#[async_trait]
impl Compute for MemoryCompute {
    async fn launch_on_demand(&self, spec: &LaunchSpec) -> Result<Vec<String>, CloudError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.launches.push(spec.clone());
        let mut ids = Vec::new();
        for _ in 0..spec.count {
            state.next_id += 1;
            let id = format!("i-{:08x}", state.next_id);
            state.instances.push(InstanceInfo {
                id: id.clone(),
                image_id: spec.image_id.clone(),
                public_dns_name: format!("node-{}.internal", state.next_id),
                launch_time: Utc::now(),
                state: "pending".to_string(),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn request_spot(&self, spec: &SpotSpec) -> Result<Vec<String>, CloudError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.bids.push(spec.clone());
        let request_type = if spec.persistent { "persistent" } else { "one-time" };
        let mut ids = Vec::new();
        for _ in 0..spec.launch.count {
            state.next_id += 1;
            let id = format!("sir-{:08x}", state.next_id);
            state.spot_requests.push(SpotRequestInfo {
                id: id.clone(),
                request_type: request_type.to_string(),
                create_time: Some(Utc::now()),
                price: spec.price.clone(),
                state: "open".to_string(),
                status: "pending-evaluation".to_string(),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn spot_price_history(
        &self,
        _instance_type: &str,
    ) -> Result<Vec<SpotPrice>, CloudError> {
        Ok(self.state().prices.clone())
    }

    async fn instances(&self) -> Result<Vec<InstanceInfo>, CloudError> {
        Ok(self.state().instances.clone())
    }

    async fn stop_instances(&self, ids: &[String], terminate: bool) -> Result<(), CloudError> {
        let mut state = self.state();
        let new_state = if terminate { "terminated" } else { "stopped" };
        for instance in state.instances.iter_mut().filter(|i| ids.contains(&i.id)) {
            instance.state = new_state.to_string();
        }
        if terminate {
            state.terminated.extend(ids.iter().cloned());
        } else {
            state.stopped.extend(ids.iter().cloned());
        }
        Ok(())
    }

    async fn spot_requests(&self) -> Result<Vec<SpotRequestInfo>, CloudError> {
        Ok(self.state().spot_requests.clone())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<(), CloudError> {
        for request in self
            .state()
            .spot_requests
            .iter_mut()
            .filter(|r| ids.contains(&r.id))
        {
            request.state = "cancelled".to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_and_terminate() {
        let compute = MemoryCompute::new();
        let ids = compute
            .launch_on_demand(&LaunchSpec {
                image_id: "ami-1".to_string(),
                instance_type: "c5.large".to_string(),
                count: 2,
                ..LaunchSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        compute.stop_instances(&ids[..1], true).await.unwrap();
        let instances = compute.instances().await.unwrap();
        assert_eq!(instances[0].state, "terminated");
        assert_eq!(instances[1].state, "pending");
        assert_eq!(compute.terminated(), vec![ids[0].clone()]);
    }

    #[tokio::test]
    async fn test_spot_request_lifecycle() {
        let compute = MemoryCompute::new();
        let ids = compute
            .request_spot(&SpotSpec {
                launch: LaunchSpec {
                    count: 1,
                    ..LaunchSpec::default()
                },
                price: "0.05".to_string(),
                persistent: true,
            })
            .await
            .unwrap();

        compute.cancel_spot_requests(&ids).await.unwrap();
        let requests = compute.spot_requests().await.unwrap();
        assert_eq!(requests[0].request_type, "persistent");
        assert_eq!(requests[0].state, "cancelled");
    }
}
