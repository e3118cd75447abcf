use crate::inventory::{
    DiscoveredInstance, GpuOffer, MachineClass, Metrics, MetricsOutcome, OfferQuery,
    ProvisionSpec, ProvisionedInstance,
};
use crate::{CloudProvider, PermanentError, SnapshotService};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// Scripted failure for the next `provision` call.
#[derive(Clone, Debug, PartialEq)]
pub enum MockFailure {
    /// Looks like a 429 / connection reset.
    Transient,
    /// Quota exceeded / invalid spec.
    Permanent,
    /// Never answers (exercises caller timeouts).
    Hang,
    /// Creates the instance, then answers only after the delay.
    Slow(Duration),
}

#[derive(Clone, Debug)]
pub struct MockInstance {
    /// Provision label, or the id for inserted instances.
    pub name: String,
    pub status: String,
    pub machine_id: Option<String>,
    pub zone: Option<String>,
    pub hourly_cost: f64,
    pub metrics: Option<Metrics>,
    pub metrics_timeout: bool,
    pub reachable: bool,
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    offers: Vec<GpuOffer>,
    provision_failures: VecDeque<MockFailure>,
    calls: Vec<String>,
    seq: u64,
}

/// In-memory provider used by tests and local runs. No network, no database.
pub struct MockProvider {
    name: String,
    checkpoint: bool,
    snapshot: bool,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checkpoint: false,
            snapshot: true,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint = enabled;
        self
    }

    pub fn with_snapshot(mut self, enabled: bool) -> Self {
        self.snapshot = enabled;
        self
    }

    /// Register a pre-existing running instance (as if discovered on the vendor side).
    pub async fn insert_instance(&self, provider_instance_id: &str, machine_id: Option<&str>) {
        let mut st = self.state.lock().await;
        st.instances.insert(
            provider_instance_id.to_string(),
            MockInstance {
                name: provider_instance_id.to_string(),
                status: "running".to_string(),
                machine_id: machine_id.map(|m| m.to_string()),
                zone: Some("mock-1".to_string()),
                hourly_cost: 1.0,
                metrics: Some(Metrics {
                    gpu_utilization_pct: 50.0,
                    vram_used_gb: 8.0,
                    cost_accumulated: 0.0,
                }),
                metrics_timeout: false,
                reachable: true,
            },
        );
    }

    /// Simulate spot preemption: the instance disappears from the vendor.
    pub async fn reclaim(&self, provider_instance_id: &str) {
        let mut st = self.state.lock().await;
        st.instances.remove(provider_instance_id);
    }

    pub async fn set_metrics(&self, provider_instance_id: &str, metrics: Option<Metrics>) {
        let mut st = self.state.lock().await;
        if let Some(inst) = st.instances.get_mut(provider_instance_id) {
            inst.metrics = metrics;
        }
    }

    pub async fn set_metrics_timeout(&self, provider_instance_id: &str, timeout: bool) {
        let mut st = self.state.lock().await;
        if let Some(inst) = st.instances.get_mut(provider_instance_id) {
            inst.metrics_timeout = timeout;
        }
    }

    pub async fn set_offers(&self, offers: Vec<GpuOffer>) {
        self.state.lock().await.offers = offers;
    }

    pub async fn push_provision_failure(&self, failure: MockFailure) {
        self.state.lock().await.provision_failures.push_back(failure);
    }

    pub async fn status_of(&self, provider_instance_id: &str) -> Option<String> {
        let st = self.state.lock().await;
        st.instances
            .get(provider_instance_id)
            .map(|i| i.status.clone())
    }

    pub async fn live_instance_count(&self) -> usize {
        let st = self.state.lock().await;
        st.instances
            .values()
            .filter(|i| i.status != "terminated")
            .count()
    }

    /// Chronological log of calls, e.g. `pause:mock-1`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    async fn record(&self, call: String) {
        self.state.lock().await.calls.push(call);
    }

    async fn set_status(&self, provider_instance_id: &str, status: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        match st.instances.get_mut(provider_instance_id) {
            Some(inst) => {
                inst.status = status.to_string();
                Ok(true)
            }
            None => Err(PermanentError(format!(
                "MockProvider: instance '{}' not found",
                provider_instance_id
            ))
            .into()),
        }
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .iter()
            .filter(|(_, i)| i.status != "terminated")
            .map(|(id, i)| DiscoveredInstance {
                provider_instance_id: id.clone(),
                name: i.name.clone(),
                zone: i.zone.clone(),
                status: i.status.clone(),
                machine_id: i.machine_id.clone(),
                hourly_cost: i.hourly_cost,
            })
            .collect())
    }

    async fn get_metrics(&self, provider_instance_id: &str, timeout: Duration) -> Result<MetricsOutcome> {
        self.record(format!("metrics:{}", provider_instance_id)).await;
        let inst = {
            let st = self.state.lock().await;
            st.instances.get(provider_instance_id).cloned()
        };
        let Some(inst) = inst else {
            return Err(anyhow::anyhow!(
                "MockProvider: connection refused for '{}'",
                provider_instance_id
            ));
        };
        if inst.metrics_timeout {
            tokio::time::sleep(timeout).await;
            return Ok(MetricsOutcome::Timeout);
        }
        if inst.status != "running" {
            return Ok(MetricsOutcome::Timeout);
        }
        match inst.metrics {
            Some(m) => Ok(MetricsOutcome::Metrics(m)),
            None => Ok(MetricsOutcome::Timeout),
        }
    }

    async fn pause(&self, provider_instance_id: &str) -> Result<bool> {
        self.record(format!("pause:{}", provider_instance_id)).await;
        self.set_status(provider_instance_id, "paused").await
    }

    async fn resume(&self, provider_instance_id: &str) -> Result<bool> {
        self.record(format!("resume:{}", provider_instance_id)).await;
        self.set_status(provider_instance_id, "running").await
    }

    async fn destroy(&self, provider_instance_id: &str) -> Result<bool> {
        self.record(format!("destroy:{}", provider_instance_id)).await;
        let mut st = self.state.lock().await;
        // Destroying something already gone is a success from the caller's point of view.
        if let Some(inst) = st.instances.get_mut(provider_instance_id) {
            inst.status = "terminated".to_string();
        }
        Ok(true)
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ProvisionedInstance> {
        self.record(format!("provision:{}", spec.offer_or_type)).await;
        let failure = self.state.lock().await.provision_failures.pop_front();
        let mut answer_after = None;
        match failure {
            Some(MockFailure::Transient) => {
                return Err(anyhow::anyhow!("MockProvider: 429 Too Many Requests"));
            }
            Some(MockFailure::Permanent) => {
                return Err(PermanentError("MockProvider: quota exceeded".to_string()).into());
            }
            Some(MockFailure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(anyhow::anyhow!("MockProvider: hang elapsed"));
            }
            Some(MockFailure::Slow(delay)) => answer_after = Some(delay),
            None => {}
        }

        let mut st = self.state.lock().await;
        st.seq += 1;
        let provider_instance_id = format!("{}-{}", self.name, st.seq);
        let (machine_id, hourly_cost) = match spec.class {
            MachineClass::Gpu => {
                let offer = st.offers.iter().find(|o| o.offer_id == spec.offer_or_type);
                match offer {
                    Some(o) => (Some(o.machine_id.clone()), o.hourly_cost),
                    None => {
                        return Err(PermanentError(format!(
                            "MockProvider: unknown offer '{}'",
                            spec.offer_or_type
                        ))
                        .into())
                    }
                }
            }
            MachineClass::Cpu => (Some(format!("cpu-host-{}", st.seq)), 0.05),
        };
        st.instances.insert(
            provider_instance_id.clone(),
            MockInstance {
                name: spec.label.clone(),
                status: "running".to_string(),
                machine_id: machine_id.clone(),
                zone: spec.zone.clone(),
                hourly_cost,
                metrics: Some(Metrics {
                    gpu_utilization_pct: 35.0,
                    vram_used_gb: 4.0,
                    cost_accumulated: 0.0,
                }),
                metrics_timeout: false,
                reachable: true,
            },
        );
        drop(st);
        if let Some(delay) = answer_after {
            tokio::time::sleep(delay).await;
        }
        Ok(ProvisionedInstance {
            provider_instance_id,
            machine_id,
            zone: spec.zone.clone(),
            hourly_cost,
        })
    }

    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<GpuOffer>> {
        self.record("search_offers".to_string()).await;
        let st = self.state.lock().await;
        Ok(st
            .offers
            .iter()
            .filter(|o| o.gpu_rank >= query.min_gpu_rank && o.vram_gb >= query.min_vram_gb)
            .filter(|o| o.gpu_count >= query.gpu_count)
            .cloned()
            .collect())
    }

    async fn is_reachable(&self, provider_instance_id: &str) -> Result<bool> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .get(provider_instance_id)
            .map(|i| i.reachable && i.status == "running")
            .unwrap_or(false))
    }

    async fn get_instance_address(&self, provider_instance_id: &str) -> Result<Option<String>> {
        Ok(Some(format!("{}.mock.internal", provider_instance_id)))
    }

    fn supports_checkpoint(&self) -> bool {
        self.checkpoint
    }

    fn supports_snapshot(&self) -> bool {
        self.snapshot
    }
}

#[derive(Default)]
struct SnapshotState {
    snapshots: HashMap<String, String>,
    restores: Vec<(String, String)>,
    fail_create: bool,
    fail_restore: bool,
}

/// In-memory snapshot collaborator with switchable failures.
#[derive(Default)]
pub struct MockSnapshotService {
    state: Mutex<SnapshotState>,
}

impl MockSnapshotService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_create(&self, fail: bool) {
        self.state.lock().await.fail_create = fail;
    }

    pub async fn set_fail_restore(&self, fail: bool) {
        self.state.lock().await.fail_restore = fail;
    }

    pub async fn snapshot_count(&self) -> usize {
        self.state.lock().await.snapshots.len()
    }

    pub async fn restores(&self) -> Vec<(String, String)> {
        self.state.lock().await.restores.clone()
    }
}

#[async_trait]
impl SnapshotService for MockSnapshotService {
    async fn create_snapshot(&self, provider_instance_id: &str) -> Result<String> {
        let mut st = self.state.lock().await;
        if st.fail_create {
            return Err(anyhow::anyhow!("MockSnapshotService: snapshot backend unavailable"));
        }
        let snapshot_ref = format!("snap-{}-{}", provider_instance_id, st.snapshots.len() + 1);
        st.snapshots
            .insert(snapshot_ref.clone(), provider_instance_id.to_string());
        Ok(snapshot_ref)
    }

    async fn restore_snapshot(&self, snapshot_ref: &str, target_provider_instance_id: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.fail_restore {
            return Err(PermanentError("MockSnapshotService: snapshot corrupted".to_string()).into());
        }
        if !st.snapshots.contains_key(snapshot_ref) {
            return Err(PermanentError(format!("unknown snapshot '{}'", snapshot_ref)).into());
        }
        st.restores
            .push((snapshot_ref.to_string(), target_provider_instance_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str, rank: u32, price: f64) -> GpuOffer {
        GpuOffer {
            offer_id: id.to_string(),
            machine_id: format!("host-{}", id),
            gpu_class: "RTX 4090".to_string(),
            gpu_rank: rank,
            gpu_count: 1,
            vram_gb: 24,
            hourly_cost: price,
            region: None,
        }
    }

    #[tokio::test]
    async fn scripted_provision_failures_are_consumed_in_order() {
        let p = MockProvider::new("mock");
        p.set_offers(vec![offer("o1", 10, 0.4)]).await;
        p.push_provision_failure(MockFailure::Transient).await;
        p.push_provision_failure(MockFailure::Permanent).await;

        let spec = ProvisionSpec {
            class: MachineClass::Gpu,
            offer_or_type: "o1".to_string(),
            zone: None,
            label: "t".to_string(),
        };
        let e1 = p.provision(&spec).await.unwrap_err();
        assert!(e1.to_string().contains("429"));
        let e2 = p.provision(&spec).await.unwrap_err();
        assert!(e2.downcast_ref::<PermanentError>().is_some());
        let ok = p.provision(&spec).await.unwrap();
        assert_eq!(ok.machine_id.as_deref(), Some("host-o1"));
        assert!(p.is_reachable(&ok.provider_instance_id).await.unwrap());
    }

    #[tokio::test]
    async fn offers_are_filtered_by_rank_and_vram() {
        let p = MockProvider::new("mock");
        p.set_offers(vec![offer("slow", 5, 0.1), offer("fast", 20, 0.9)]).await;
        let found = p
            .search_offers(&OfferQuery {
                min_gpu_rank: 10,
                min_vram_gb: 16,
                gpu_count: 1,
                region: None,
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offer_id, "fast");
    }

    #[tokio::test]
    async fn reclaimed_instance_disappears_from_listing() {
        let p = MockProvider::new("mock");
        p.insert_instance("i-1", Some("m-1")).await;
        assert_eq!(p.list_instances().await.unwrap().len(), 1);
        p.reclaim("i-1").await;
        assert!(p.list_instances().await.unwrap().is_empty());
        assert!(p.get_metrics("i-1", Duration::from_millis(5)).await.is_err());
    }
}
