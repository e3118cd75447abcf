use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleetwarden_common::{
    FleetError, GpuSpec, Instance, InstanceKind, InstanceStatus, LivenessState, Policy,
    StandbyAssociation,
};
use fleetwarden_providers::SnapshotService;
use serde::Serialize;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::config::{PolicyHandle, Settings};
use crate::decision::EvaluationContext;
use crate::failover::{FailoverComponents, FailoverOrchestrator};
use crate::liveness::{self, LivenessContext};
use crate::logger::ActionLogger;
use crate::notifier::NotificationSink;
use crate::provider_manager::ProviderRegistry;
use crate::reliability::ReliabilityLedger;
use crate::roster::{Roster, Tracking};
use crate::sample_store::SampleStore;
use crate::standby::StandbyManager;
use crate::sync_engine::SyncEngine;
use crate::transport::SyncTransport;

/// Everything the jobs, the heartbeat path and the HTTP surface share.
pub struct Fleet {
    pub settings: Settings,
    pub policy: PolicyHandle,
    pub roster: Arc<Roster>,
    pub samples: Arc<SampleStore>,
    pub providers: Arc<ProviderRegistry>,
    pub snapshots: Option<Arc<dyn SnapshotService>>,
    pub ledger: Arc<ReliabilityLedger>,
    pub standby: Arc<StandbyManager>,
    pub sync: Arc<SyncEngine>,
    pub failover: Arc<FailoverOrchestrator>,
    pub notifier: Arc<dyn NotificationSink>,
    pub logger: ActionLogger,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub id: Uuid,
    pub provider: String,
    pub provider_instance_id: String,
    pub kind: InstanceKind,
    pub status: InstanceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub seconds_since_heartbeat: Option<i64>,
    pub health: LivenessState,
    pub gpu_utilization: Option<f64>,
    pub cost_today: f64,
    pub alert: Option<String>,
    pub protected: bool,
    pub keepalive_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub generated_at: DateTime<Utc>,
    pub instances: Vec<InstanceView>,
    pub standbys: Vec<StandbyAssociation>,
    pub active_failovers: usize,
}

/// Operator registration of an instance that is already running somewhere.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterInstance {
    pub provider: String,
    pub provider_instance_id: String,
    pub gpu: GpuSpec,
    #[serde(default)]
    pub has_agent: bool,
    #[serde(default)]
    pub hourly_cost: f64,
    #[serde(default)]
    pub protected: bool,
    pub zone: Option<String>,
    pub region: Option<String>,
    pub machine_id: Option<String>,
    /// Backdate the instance, e.g. when adopting a long-running machine.
    pub created_at: Option<DateTime<Utc>>,
}

impl Fleet {
    pub fn new(
        settings: Settings,
        policy: PolicyHandle,
        providers: ProviderRegistry,
        snapshots: Option<Arc<dyn SnapshotService>>,
        transport: Arc<dyn SyncTransport>,
        notifier: Arc<dyn NotificationSink>,
        db: Option<Pool<Postgres>>,
    ) -> Arc<Self> {
        let logger = ActionLogger::new(db.clone());
        let roster = Arc::new(Roster::new());
        let samples = Arc::new(SampleStore::new(
            settings.sample_retention,
            settings.sample_max_age_minutes,
            (settings.heartbeat_interval_seconds / 2) as i64,
        )
        .with_max_skew(Duration::seconds(2 * settings.heartbeat_interval_seconds as i64)));
        let providers = Arc::new(providers);
        let ledger = Arc::new(ReliabilityLedger::new(settings.reliability.clone(), db));
        let standby = Arc::new(StandbyManager::new(
            settings.standby.clone(),
            settings.provider_calls.clone(),
            settings.sync.failure_threshold,
            providers.clone(),
            roster.clone(),
            logger.clone(),
        ));
        let sync = Arc::new(SyncEngine::new(
            settings.sync.clone(),
            standby.clone(),
            roster.clone(),
            providers.clone(),
            transport.clone(),
            notifier.clone(),
            logger.clone(),
        ));
        let failover = Arc::new(FailoverOrchestrator::new(
            settings.failover.clone(),
            settings.provider_calls.clone(),
            FailoverComponents {
                roster: roster.clone(),
                samples: samples.clone(),
                providers: providers.clone(),
                snapshots: snapshots.clone(),
                ledger: ledger.clone(),
                standby: standby.clone(),
                sync: sync.clone(),
                transport,
                notifier: notifier.clone(),
                logger: logger.clone(),
            },
        ));

        Arc::new(Self {
            settings,
            policy,
            roster,
            samples,
            providers,
            snapshots,
            ledger,
            standby,
            sync,
            failover,
            notifier,
            logger,
        })
    }

    pub async fn register(&self, req: RegisterInstance) -> Result<Instance, FleetError> {
        let provider = self.providers.get(&req.provider)?;
        if let Some(existing) = self
            .roster
            .find_by_provider_id(provider.name(), &req.provider_instance_id)
            .await
        {
            return self
                .roster
                .get(existing)
                .await
                .ok_or_else(|| FleetError::NotFound(format!("instance {}", existing)));
        }
        let mut instance = Instance::new_gpu(provider.name(), &req.provider_instance_id, req.gpu);
        instance.has_agent = req.has_agent;
        instance.hourly_cost = req.hourly_cost;
        instance.protected = req.protected;
        instance.zone = req.zone;
        instance.region = req.region;
        instance.machine_id = req.machine_id;
        instance.checkpoint_capable = provider.supports_checkpoint();
        if let Some(created_at) = req.created_at {
            instance.created_at = created_at;
        }
        self.roster.insert(instance.clone()).await;
        tracing::info!(
            instance_id = %instance.id,
            "🧩 [fleet] registered {}/{}",
            instance.provider,
            instance.provider_instance_id
        );
        Ok(instance)
    }

    /// Register every instance the providers list that the roster does not know yet.
    /// Run once at start-up before the jobs.
    pub async fn adopt_discovered(&self) -> usize {
        let mut adopted = 0;
        for provider in self.providers.all() {
            let listed = match provider.list_instances().await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!("⚠️ [fleet] discovery on {} failed: {}", provider.name(), e);
                    continue;
                }
            };
            for d in listed {
                if self
                    .roster
                    .find_by_provider_id(provider.name(), &d.provider_instance_id)
                    .await
                    .is_some()
                {
                    continue;
                }
                let mut instance = Instance::new_gpu(
                    provider.name(),
                    &d.provider_instance_id,
                    GpuSpec {
                        gpu_class: "unknown".to_string(),
                        gpu_rank: 0,
                        gpu_count: 1,
                        vram_gb: 0,
                    },
                );
                instance.zone = d.zone;
                instance.machine_id = d.machine_id;
                instance.hourly_cost = d.hourly_cost;
                instance.checkpoint_capable = provider.supports_checkpoint();
                instance.status = match d.status.as_str() {
                    "paused" | "stopped" => InstanceStatus::Paused,
                    _ => InstanceStatus::Running,
                };
                self.roster.insert(instance).await;
                adopted += 1;
            }
        }
        if adopted > 0 {
            tracing::info!("🔍 [fleet] adopted {} discovered instance(s)", adopted);
        }
        adopted
    }

    pub fn liveness_context(&self, tracking: &Tracking) -> LivenessContext {
        LivenessContext {
            provider_terminated: tracking.provider_terminated,
            anchor: tracking.resumed_at,
            keepalive_until: tracking.keepalive_until,
        }
    }

    pub async fn classify(&self, instance: &Instance, tracking: &Tracking, policy: &Policy, now: DateTime<Utc>) -> LivenessState {
        let samples = self.samples.snapshot(instance.id).await;
        liveness::classify_instance(now, instance, &samples, &self.liveness_context(tracking), policy)
    }

    pub async fn evaluation_context(&self, instance: &Instance, tracking: &Tracking) -> EvaluationContext {
        let snapshot_supported = self
            .providers
            .get(&instance.provider)
            .map(|p| p.supports_snapshot())
            .unwrap_or(false)
            && self.snapshots.is_some();
        EvaluationContext {
            standby_ready: self.standby.is_ready(instance.id).await,
            standby_degraded: self.standby.is_degraded(instance.id).await,
            active_session: self.failover.has_active(instance.id),
            orphan_observations: tracking.orphan_observations,
            unhealthy_since: tracking.unhealthy_since,
            checkpoint_capable: instance.checkpoint_capable && self.snapshots.is_some(),
            snapshot_supported,
        }
    }

    /// Operator keep-alive. Minutes are capped by `KEEPALIVE_MAX_MINUTES`.
    pub async fn keepalive(&self, instance_id: Uuid, minutes: i64) -> Result<DateTime<Utc>, FleetError> {
        if minutes <= 0 {
            return Err(FleetError::PolicyViolation("keep-alive minutes must be positive".to_string()));
        }
        let minutes = minutes.min(self.settings.keepalive_max_minutes);
        let until = Utc::now() + Duration::minutes(minutes);
        self.roster.set_keepalive(instance_id, until).await?;
        self.logger
            .log_event_with_metadata(
                "KEEPALIVE",
                "success",
                instance_id,
                None,
                Some(serde_json::json!({ "minutes": minutes, "until": until })),
            )
            .await
            .ok();
        tracing::info!(%instance_id, "⏳ [fleet] keep-alive for {} min (until {})", minutes, until);
        Ok(until)
    }

    /// Provision a standby and seed it with a first sync.
    pub async fn request_standby(&self, primary_id: Uuid) -> Result<StandbyAssociation, FleetError> {
        let assoc = self.standby.provision(primary_id).await?;
        if let Err(e) = self.sync.sync_now(primary_id).await {
            tracing::warn!(%primary_id, "⚠️ [fleet] initial sync to standby failed: {}", e);
        }
        Ok(self.standby.get(primary_id).await.unwrap_or(assoc))
    }

    pub fn reload_policy(&self) -> Result<Arc<Policy>, FleetError> {
        self.policy
            .reload()
            .map_err(|e| FleetError::PolicyViolation(format!("policy reload rejected: {}", e)))
    }

    /// Best-known state of every instance. Never queries providers.
    pub async fn status(&self, now: DateTime<Utc>) -> FleetStatus {
        let policy = self.policy.current();
        let mut instances = Vec::new();
        for instance in self.roster.list().await {
            if instance.status == InstanceStatus::Destroyed {
                continue;
            }
            let tracking = self.roster.tracking(instance.id).await.unwrap_or_default();
            let samples = self.samples.snapshot(instance.id).await;
            let health = liveness::classify_instance(
                now,
                &instance,
                &samples,
                &self.liveness_context(&tracking),
                &policy,
            );
            let last_heartbeat = samples.last().map(|s| s.timestamp);
            let seconds_since_heartbeat = last_heartbeat.map(|t| (now - t).num_seconds().max(0));
            let degraded = instance.kind == InstanceKind::Gpu && self.standby.is_degraded(instance.id).await;
            let alert = match health {
                LivenessState::Lost => Some("presumed lost by provider".to_string()),
                LivenessState::Orphaned => Some(format!(
                    "no heartbeat for {} min",
                    seconds_since_heartbeat.unwrap_or(0) / 60
                )),
                _ if degraded => Some("standby degraded: sync failing".to_string()),
                _ => None,
            };
            instances.push(InstanceView {
                id: instance.id,
                provider: instance.provider.clone(),
                provider_instance_id: instance.provider_instance_id.clone(),
                kind: instance.kind,
                status: instance.status,
                last_heartbeat,
                seconds_since_heartbeat,
                health,
                gpu_utilization: samples.last().map(|s| s.gpu_utilization_pct),
                cost_today: cost_today(&samples, now),
                alert,
                protected: policy.is_protected(&instance),
                keepalive_until: tracking.keepalive_until.filter(|u| *u > now),
            });
        }
        let active_failovers = self.failover.sessions().iter().filter(|s| s.is_active()).count();
        FleetStatus {
            generated_at: now,
            instances,
            standbys: self.standby.list().await,
            active_failovers,
        }
    }
}

/// Latest accumulated cost minus the first sample of the current UTC day.
pub fn cost_today(samples: &[fleetwarden_common::HeartbeatSample], now: DateTime<Utc>) -> f64 {
    let today = now.date_naive();
    let mut todays = samples.iter().filter(|s| s.timestamp.date_naive() == today);
    let Some(first) = todays.next() else {
        return 0.0;
    };
    let last = todays.last().unwrap_or(first);
    (last.cost_accumulated - first.cost_accumulated).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleetwarden_common::{HeartbeatSample, SampleSource};

    fn sample(at: DateTime<Utc>, cost: f64) -> HeartbeatSample {
        HeartbeatSample {
            instance_id: Uuid::nil(),
            timestamp: at,
            gpu_utilization_pct: 40.0,
            vram_used_gb: 4.0,
            cost_accumulated: cost,
            source: SampleSource::Agent,
        }
    }

    #[test]
    fn cost_today_ignores_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let samples = vec![
            sample(Utc.with_ymd_and_hms(2024, 5, 1, 23, 50, 0).unwrap(), 10.0),
            sample(Utc.with_ymd_and_hms(2024, 5, 2, 0, 10, 0).unwrap(), 11.0),
            sample(Utc.with_ymd_and_hms(2024, 5, 2, 11, 0, 0).unwrap(), 14.5),
        ];
        assert!((cost_today(&samples, now) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn cost_today_is_zero_without_samples_today() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let samples = vec![sample(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(), 10.0)];
        assert_eq!(cost_today(&samples, now), 0.0);
        assert_eq!(cost_today(&[], now), 0.0);
    }
}
