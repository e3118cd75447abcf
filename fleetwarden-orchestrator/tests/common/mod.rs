//! Shared fixtures for the orchestrator integration tests: an in-memory fleet
//! wired to mock providers, a scriptable transport and a recording notifier.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use chrono::{DateTime, Utc};
use fleetwarden_common::bus::Severity;
use fleetwarden_common::{FailoverSession, GpuSpec, HeartbeatSample, Instance, Policy, SampleSource};
use fleetwarden_orchestrator::api;
use fleetwarden_orchestrator::config::{
    FailoverSettings, PolicyHandle, ProviderCallSettings, Settings, SyncSettings,
};
use fleetwarden_orchestrator::fleet::Fleet;
use fleetwarden_orchestrator::notifier::MemorySink;
use fleetwarden_orchestrator::provider_manager::ProviderRegistry;
use fleetwarden_orchestrator::transport::memory::MemoryTransport;
use fleetwarden_providers::inventory::GpuOffer;
use fleetwarden_providers::mock::{MockProvider, MockSnapshotService};
use fleetwarden_providers::SnapshotService;
use uuid::Uuid;

pub const GPU_PROVIDER: &str = "mock";
pub const CPU_PROVIDER: &str = "mock-cpu";

/// Millisecond-scale timeouts so failure paths finish quickly.
pub fn fast_settings() -> Settings {
    Settings {
        provider_calls: ProviderCallSettings {
            timeout: Duration::from_millis(500),
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
        },
        failover: FailoverSettings {
            search_timeout: Duration::from_secs(2),
            provision_timeout: Duration::from_secs(2),
            max_provision_attempts: 3,
            restore_timeout: Duration::from_secs(5),
            health_timeout: Duration::from_secs(2),
            health_poll_interval: Duration::from_millis(10),
            continuous_protection: true,
            alert_failovers_per_hour: 3,
        },
        sync: SyncSettings {
            failure_threshold: 2,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            ..SyncSettings::default()
        },
        enable_test_endpoints: true,
        provider_names: vec![GPU_PROVIDER.to_string(), CPU_PROVIDER.to_string()],
        ..Settings::default()
    }
}

pub struct Harness {
    pub fleet: Arc<Fleet>,
    pub gpu: Arc<MockProvider>,
    pub cpu: Arc<MockProvider>,
    pub snapshots: Arc<MockSnapshotService>,
    pub transport: Arc<MemoryTransport>,
    pub notifier: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(fast_settings(), Policy::default())
    }

    pub fn with(settings: Settings, policy: Policy) -> Self {
        let gpu = Arc::new(MockProvider::new(GPU_PROVIDER));
        let cpu = Arc::new(MockProvider::new(CPU_PROVIDER));
        let registry = ProviderRegistry::new().with(gpu.clone()).with(cpu.clone());
        let snapshots = Arc::new(MockSnapshotService::new());
        let transport = Arc::new(MemoryTransport::new());
        let notifier = Arc::new(MemorySink::new());
        let snapshot_service: Arc<dyn SnapshotService> = snapshots.clone();

        let fleet = Fleet::new(
            settings,
            PolicyHandle::new(policy, None),
            registry,
            Some(snapshot_service),
            transport.clone(),
            notifier.clone(),
            None,
        );
        Self {
            fleet,
            gpu,
            cpu,
            snapshots,
            transport,
            notifier,
        }
    }

    pub fn server(&self) -> TestServer {
        TestServer::new(api::router(self.fleet.clone())).unwrap()
    }

    /// A running GPU primary known to both the mock provider and the roster,
    /// created two hours ago so the minimum-age guard does not apply.
    pub async fn primary(&self, provider_instance_id: &str, machine_id: &str) -> Instance {
        self.gpu.insert_instance(provider_instance_id, Some(machine_id)).await;
        let mut instance = Instance::new_gpu(GPU_PROVIDER, provider_instance_id, t4());
        instance.created_at = Utc::now() - chrono::Duration::hours(2);
        instance.machine_id = Some(machine_id.to_string());
        instance.hourly_cost = 1.0;
        instance.has_agent = true;
        self.fleet.roster.insert(instance.clone()).await;
        instance
    }

    /// Agent samples one minute apart, the last one at `last`.
    pub async fn feed(&self, instance_id: Uuid, utilizations: &[f64], last: DateTime<Utc>) {
        let n = utilizations.len() as i64;
        for (i, util) in utilizations.iter().enumerate() {
            let timestamp = last - chrono::Duration::minutes(n - 1 - i as i64);
            self.fleet
                .samples
                .append(HeartbeatSample {
                    instance_id,
                    timestamp,
                    gpu_utilization_pct: *util,
                    vram_used_gb: 2.0,
                    cost_accumulated: 0.0,
                    source: SampleSource::Agent,
                })
                .await;
        }
    }

    pub async fn instance(&self, id: Uuid) -> Instance {
        self.fleet.roster.get(id).await.expect("instance in roster")
    }

    pub async fn find(&self, provider: &str, provider_instance_id: &str) -> Option<Instance> {
        let id = self.fleet.roster.find_by_provider_id(provider, provider_instance_id).await?;
        self.fleet.roster.get(id).await
    }

    pub fn notifications(&self, severity: Severity) -> Vec<String> {
        self.notifier
            .messages()
            .into_iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m)
            .collect()
    }

    /// Wait until the failover session reaches a terminal phase.
    pub async fn finished(&self, session_id: Uuid) -> FailoverSession {
        let fleet = self.fleet.clone();
        let done = eventually(move || {
            let fleet = fleet.clone();
            async move {
                fleet
                    .failover
                    .session(session_id)
                    .map(|s| !s.is_active())
                    .unwrap_or(false)
            }
        })
        .await;
        assert!(done, "failover session {} did not finish", session_id);
        self.fleet.failover.session(session_id).expect("session recorded")
    }
}

pub fn t4() -> GpuSpec {
    GpuSpec {
        gpu_class: "T4".to_string(),
        gpu_rank: 2,
        gpu_count: 1,
        vram_gb: 16,
    }
}

pub fn offer(offer_id: &str, machine_id: &str, gpu_rank: u32, vram_gb: u32, hourly_cost: f64) -> GpuOffer {
    GpuOffer {
        offer_id: offer_id.to_string(),
        machine_id: machine_id.to_string(),
        gpu_class: if gpu_rank >= 3 { "A100" } else { "T4" }.to_string(),
        gpu_rank,
        gpu_count: 1,
        vram_gb,
        hourly_cost,
        region: None,
    }
}

/// Poll `check` every 10ms for up to 5s.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
