use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Uniform capability implemented once per vendor (spot marketplaces, bare metal).
/// Auth, request signing and vendor rate limiting are the adapter's business.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn list_instances(&self) -> Result<Vec<inventory::DiscoveredInstance>>;

    /// Remote metrics query. A query that exceeds `timeout` must resolve to
    /// `MetricsOutcome::Timeout` rather than an error.
    async fn get_metrics(
        &self,
        provider_instance_id: &str,
        timeout: Duration,
    ) -> Result<inventory::MetricsOutcome>;

    async fn pause(&self, provider_instance_id: &str) -> Result<bool>;
    async fn resume(&self, provider_instance_id: &str) -> Result<bool>;
    async fn destroy(&self, provider_instance_id: &str) -> Result<bool>;

    async fn provision(
        &self,
        spec: &inventory::ProvisionSpec,
    ) -> Result<inventory::ProvisionedInstance>;

    // Optional: marketplace search for replacement GPUs.
    // Default implementation returns no offers (provider cannot host replacements).
    async fn search_offers(
        &self,
        _query: &inventory::OfferQuery,
    ) -> Result<Vec<inventory::GpuOffer>> {
        Ok(vec![])
    }

    // Optional: reachability probe used after provisioning.
    // Default implementation assumes reachable once provision returned.
    async fn is_reachable(&self, _provider_instance_id: &str) -> Result<bool> {
        Ok(true)
    }

    // Optional: public address used by data transfer tooling.
    async fn get_instance_address(&self, _provider_instance_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// GPU-memory checkpoint before pause (fast resume). Default: not supported.
    fn supports_checkpoint(&self) -> bool {
        false
    }

    /// Whether a disk snapshot can be taken before destroy. Default: not supported.
    fn supports_snapshot(&self) -> bool {
        false
    }
}

/// External checkpoint/snapshot collaborator. The format is opaque here.
#[async_trait]
pub trait SnapshotService: Send + Sync {
    async fn create_snapshot(&self, provider_instance_id: &str) -> Result<String>;
    async fn restore_snapshot(&self, snapshot_ref: &str, target_provider_instance_id: &str)
        -> Result<()>;
}

/// Marker error adapters can return (via `anyhow`) to signal a non-retryable failure.
#[derive(Debug, Clone)]
pub struct PermanentError(pub String);

impl std::fmt::Display for PermanentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "permanent: {}", self.0)
    }
}

impl std::error::Error for PermanentError {}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct DiscoveredInstance {
        pub provider_instance_id: String,
        pub name: String,
        pub zone: Option<String>,
        pub status: String,
        pub machine_id: Option<String>,
        pub hourly_cost: f64,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Metrics {
        pub gpu_utilization_pct: f64,
        pub vram_used_gb: f64,
        pub cost_accumulated: f64,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub enum MetricsOutcome {
        Metrics(Metrics),
        Timeout,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum MachineClass {
        Gpu,
        Cpu,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct ProvisionSpec {
        pub class: MachineClass,
        /// Offer id for marketplace providers, machine type for the rest.
        pub offer_or_type: String,
        pub zone: Option<String>,
        pub label: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct ProvisionedInstance {
        pub provider_instance_id: String,
        pub machine_id: Option<String>,
        pub zone: Option<String>,
        pub hourly_cost: f64,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct OfferQuery {
        pub min_gpu_rank: u32,
        pub min_vram_gb: u32,
        pub gpu_count: u32,
        pub region: Option<String>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct GpuOffer {
        pub offer_id: String,
        pub machine_id: String,
        pub gpu_class: String,
        pub gpu_rank: u32,
        pub gpu_count: u32,
        pub vram_gb: u32,
        pub hourly_cost: f64,
        pub region: Option<String>,
    }
}

#[cfg(feature = "mock")]
pub mod mock;
