use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetwarden_common::{
    FleetError, Instance, InstanceKind, InstanceStatus, StandbyAssociation, StandbyState,
};
use fleetwarden_providers::inventory::{MachineClass, ProvisionSpec};
use fleetwarden_providers::CloudProvider;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::{ProviderCallSettings, StandbySettings};
use crate::logger::{elapsed_ms, ActionLogger};
use crate::provider_manager::ProviderRegistry;
use crate::retry::call_with_retry;
use crate::roster::Roster;
use crate::state_machine;

/// Owns standby lifecycles: at most one active association per primary.
pub struct StandbyManager {
    settings: StandbySettings,
    calls: ProviderCallSettings,
    failure_threshold: u32,
    providers: Arc<ProviderRegistry>,
    roster: Arc<Roster>,
    logger: ActionLogger,
    active: RwLock<HashMap<Uuid, StandbyAssociation>>,
    retired: RwLock<Vec<StandbyAssociation>>,
}

impl StandbyManager {
    pub fn new(
        settings: StandbySettings,
        calls: ProviderCallSettings,
        failure_threshold: u32,
        providers: Arc<ProviderRegistry>,
        roster: Arc<Roster>,
        logger: ActionLogger,
    ) -> Self {
        Self {
            settings,
            calls,
            failure_threshold: failure_threshold.max(1),
            providers,
            roster,
            logger,
            active: RwLock::new(HashMap::new()),
            retired: RwLock::new(Vec::new()),
        }
    }

    /// Configured standby provider, else any provider other than the primary's,
    /// else the primary's own provider.
    fn pick_provider(&self, primary: &Instance) -> Result<Arc<dyn CloudProvider>, FleetError> {
        if let Some(name) = &self.settings.provider {
            return self.providers.get(name);
        }
        let all = self.providers.all();
        all.iter()
            .find(|p| !p.name().eq_ignore_ascii_case(&primary.provider))
            .or_else(|| all.first())
            .cloned()
            .ok_or_else(|| FleetError::NotFound("no provider available for standby".to_string()))
    }

    fn pick_zone(&self, primary: &Instance) -> Option<String> {
        let region = primary.region.as_ref().or(primary.zone.as_ref())?;
        Some(
            self.settings
                .region_map
                .get(region)
                .cloned()
                .unwrap_or_else(|| region.clone()),
        )
    }

    /// Provision a standby for `primary_id`. Idempotent: an existing active
    /// association is returned unchanged.
    pub async fn provision(&self, primary_id: Uuid) -> Result<StandbyAssociation, FleetError> {
        let primary = self
            .roster
            .get(primary_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("instance {}", primary_id)))?;
        if primary.kind != InstanceKind::Gpu || primary.status == InstanceStatus::Destroyed {
            return Err(FleetError::PolicyViolation(format!(
                "instance {} cannot carry a standby",
                primary_id
            )));
        }
        let provider = self.pick_provider(&primary)?;
        let zone = self.pick_zone(&primary);

        // Reserve the slot before any network call.
        let assoc = {
            let mut active = self.active.write().await;
            if let Some(existing) = active.get(&primary_id) {
                return Ok(existing.clone());
            }
            let assoc = StandbyAssociation {
                id: Uuid::new_v4(),
                primary_id,
                standby_id: None,
                provider: provider.name().to_string(),
                zone: zone.clone(),
                machine_type: self.settings.machine_type.clone(),
                state: StandbyState::Provisioning,
                sync_count: 0,
                last_sync_time: None,
                sync_failures: 0,
                degraded: false,
                created_at: Utc::now(),
                retired_at: None,
            };
            active.insert(primary_id, assoc.clone());
            assoc
        };

        let start = std::time::Instant::now();
        let log_id = self
            .logger
            .log_event_with_metadata(
                "STANDBY_PROVISION",
                "in_progress",
                primary_id,
                None,
                Some(serde_json::json!({
                    "provider": assoc.provider,
                    "zone": assoc.zone,
                    "machine_type": assoc.machine_type,
                })),
            )
            .await
            .ok();

        let spec = ProvisionSpec {
            class: MachineClass::Cpu,
            offer_or_type: self.settings.machine_type.clone(),
            zone: zone.clone(),
            label: format!("standby-{}", primary_id),
        };
        let provisioned = call_with_retry(&self.calls, "standby provision", || {
            let provider = provider.clone();
            let spec = spec.clone();
            async move { provider.provision(&spec).await }
        })
        .await;

        let provisioned = match provisioned {
            Ok(p) => p,
            Err(e) => {
                self.active.write().await.remove(&primary_id);
                if let Some(lid) = log_id {
                    self.logger
                        .log_event_complete(lid, "failed", elapsed_ms(start), Some(&e.to_string()))
                        .await
                        .ok();
                }
                return Err(e);
            }
        };

        let mut standby = Instance::new_standby(provider.name(), &provisioned.provider_instance_id);
        standby.zone = provisioned.zone.clone();
        standby.region = zone;
        standby.machine_id = provisioned.machine_id.clone();
        standby.hourly_cost = provisioned.hourly_cost;
        let standby_id = self.roster.insert(standby).await;

        let updated = self.active.write().await.get_mut(&primary_id).map(|a| {
            a.standby_id = Some(standby_id);
            a.state = StandbyState::Syncing;
            a.clone()
        });
        let Some(assoc) = updated else {
            // torn down while provisioning
            self.destroy_standby(&assoc.provider, standby_id).await.ok();
            return Err(FleetError::Cancelled(format!(
                "standby for {} was torn down during provisioning",
                primary_id
            )));
        };

        tracing::info!(
            %primary_id,
            %standby_id,
            "🛟 [standby] provisioned on {} ({}), syncing",
            assoc.provider,
            provisioned.provider_instance_id
        );
        if let Some(lid) = log_id {
            self.logger
                .log_event_complete(lid, "success", elapsed_ms(start), None)
                .await
                .ok();
        }
        Ok(assoc)
    }

    async fn destroy_standby(&self, provider_name: &str, standby_id: Uuid) -> Result<(), FleetError> {
        let Some(instance) = self.roster.get(standby_id).await else {
            return Ok(());
        };
        if instance.status != InstanceStatus::Destroyed {
            let provider = self.providers.get(provider_name)?;
            let pid = instance.provider_instance_id.clone();
            call_with_retry(&self.calls, "standby destroy", || {
                let provider = provider.clone();
                let pid = pid.clone();
                async move { provider.destroy(&pid).await }
            })
            .await?;
        }
        state_machine::mark_destroyed(&self.roster, &self.logger, standby_id, "standby teardown").await?;
        Ok(())
    }

    /// Destroy the standby resource and retire the association.
    /// On provider failure the association stays active so teardown can be retried.
    pub async fn teardown_for(&self, primary_id: Uuid, reason: &str) -> Result<Option<StandbyAssociation>, FleetError> {
        let Some(assoc) = self.get(primary_id).await else {
            return Ok(None);
        };
        if let Some(standby_id) = assoc.standby_id {
            self.destroy_standby(&assoc.provider, standby_id).await?;
        }
        let retired = self.retire(primary_id, reason).await;
        Ok(retired)
    }

    /// Close the association without touching the provider (resource already gone).
    pub async fn retire(&self, primary_id: Uuid, reason: &str) -> Option<StandbyAssociation> {
        let mut assoc = self.active.write().await.remove(&primary_id)?;
        assoc.state = StandbyState::Retired;
        assoc.retired_at = Some(Utc::now());
        tracing::info!(%primary_id, "🛟 [standby] association {} retired ({})", assoc.id, reason);
        self.retired.write().await.push(assoc.clone());
        Some(assoc)
    }

    pub async fn get(&self, primary_id: Uuid) -> Option<StandbyAssociation> {
        self.active.read().await.get(&primary_id).cloned()
    }

    pub async fn primary_for_standby(&self, standby_id: Uuid) -> Option<Uuid> {
        self.active
            .read()
            .await
            .values()
            .find(|a| a.standby_id == Some(standby_id))
            .map(|a| a.primary_id)
    }

    pub async fn list(&self) -> Vec<StandbyAssociation> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn history(&self) -> Vec<StandbyAssociation> {
        self.retired.read().await.clone()
    }

    pub async fn is_ready(&self, primary_id: Uuid) -> bool {
        self.active
            .read()
            .await
            .get(&primary_id)
            .map(|a| a.state == StandbyState::Ready)
            .unwrap_or(false)
    }

    pub async fn is_degraded(&self, primary_id: Uuid) -> bool {
        self.active
            .read()
            .await
            .get(&primary_id)
            .map(|a| a.degraded)
            .unwrap_or(false)
    }

    pub async fn mark_failover_active(&self, primary_id: Uuid) -> Option<StandbyAssociation> {
        let mut active = self.active.write().await;
        let a = active.get_mut(&primary_id)?;
        a.state = StandbyState::FailoverActive;
        Some(a.clone())
    }

    pub async fn record_sync_success(&self, primary_id: Uuid, at: DateTime<Utc>) -> Option<StandbyAssociation> {
        let mut active = self.active.write().await;
        let a = active.get_mut(&primary_id)?;
        a.sync_count += 1;
        a.last_sync_time = Some(at);
        a.sync_failures = 0;
        a.degraded = false;
        if a.state == StandbyState::Syncing {
            a.state = StandbyState::Ready;
            tracing::info!(%primary_id, "✅ [standby] first sync complete, standby ready");
        }
        Some(a.clone())
    }

    /// Returns the failure count and whether this failure crossed the degraded threshold.
    pub async fn record_sync_failure(&self, primary_id: Uuid) -> Option<(u32, bool)> {
        let mut active = self.active.write().await;
        let a = active.get_mut(&primary_id)?;
        a.sync_failures += 1;
        let newly_degraded = !a.degraded && a.sync_failures >= self.failure_threshold;
        if newly_degraded {
            a.degraded = true;
        }
        Some((a.sync_failures, newly_degraded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwarden_common::GpuSpec;
    use fleetwarden_providers::mock::MockProvider;
    use std::time::Duration;

    fn fast_calls() -> ProviderCallSettings {
        ProviderCallSettings {
            timeout: Duration::from_secs(1),
            max_attempts: 1,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(1),
        }
    }

    async fn setup(region_map: &[(&str, &str)]) -> (StandbyManager, Arc<Roster>, Arc<MockProvider>, Uuid) {
        let gpu_cloud = Arc::new(MockProvider::new("mock"));
        let cpu_cloud = Arc::new(MockProvider::new("mock-cpu"));
        let registry = ProviderRegistry::new()
            .with(gpu_cloud.clone())
            .with(cpu_cloud.clone());
        let roster = Arc::new(Roster::new());
        let mut primary = Instance::new_gpu(
            "mock",
            "gpu-1",
            GpuSpec {
                gpu_class: "A100".into(),
                gpu_rank: 10,
                gpu_count: 1,
                vram_gb: 80,
            },
        );
        primary.region = Some("us-east".into());
        let id = roster.insert(primary).await;
        let settings = StandbySettings {
            region_map: region_map
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..StandbySettings::default()
        };
        let mgr = StandbyManager::new(
            settings,
            fast_calls(),
            3,
            Arc::new(registry),
            roster.clone(),
            ActionLogger::default(),
        );
        (mgr, roster, cpu_cloud, id)
    }

    #[tokio::test]
    async fn provision_prefers_other_provider_and_mapped_region() {
        let (mgr, roster, cpu_cloud, primary) = setup(&[("us-east", "us-east1")]).await;
        let a = mgr.provision(primary).await.unwrap();
        assert_eq!(a.provider, "mock-cpu");
        assert_eq!(a.zone.as_deref(), Some("us-east1"));
        assert_eq!(a.state, StandbyState::Syncing);
        let standby = roster.get(a.standby_id.unwrap()).await.unwrap();
        assert_eq!(standby.kind, InstanceKind::CpuStandby);
        assert_eq!(cpu_cloud.live_instance_count().await, 1);

        // idempotent
        let again = mgr.provision(primary).await.unwrap();
        assert_eq!(again.id, a.id);
        assert_eq!(cpu_cloud.live_instance_count().await, 1);
    }

    #[tokio::test]
    async fn sync_outcomes_drive_ready_and_degraded() {
        let (mgr, _roster, _cpu, primary) = setup(&[]).await;
        mgr.provision(primary).await.unwrap();
        assert!(!mgr.is_ready(primary).await);
        mgr.record_sync_success(primary, Utc::now()).await;
        assert!(mgr.is_ready(primary).await);

        assert_eq!(mgr.record_sync_failure(primary).await, Some((1, false)));
        assert_eq!(mgr.record_sync_failure(primary).await, Some((2, false)));
        assert_eq!(mgr.record_sync_failure(primary).await, Some((3, true)));
        assert!(mgr.is_degraded(primary).await);
        // degraded standbys stay ready (still restorable)
        assert!(mgr.is_ready(primary).await);
    }

    #[tokio::test]
    async fn teardown_destroys_resource_and_retires() {
        let (mgr, roster, cpu_cloud, primary) = setup(&[]).await;
        let a = mgr.provision(primary).await.unwrap();
        let retired = mgr.teardown_for(primary, "primary destroyed").await.unwrap().unwrap();
        assert_eq!(retired.state, StandbyState::Retired);
        assert!(mgr.get(primary).await.is_none());
        assert_eq!(mgr.history().await.len(), 1);
        assert_eq!(cpu_cloud.live_instance_count().await, 0);
        let standby = roster.get(a.standby_id.unwrap()).await.unwrap();
        assert_eq!(standby.status, InstanceStatus::Destroyed);
        // nothing left to tear down
        assert!(mgr.teardown_for(primary, "again").await.unwrap().is_none());
    }
}
