use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use fleetwarden_common::bus::Severity;
use fleetwarden_common::{FleetError, InstanceStatus, RestorePoint, RestoreSource, StandbyState};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::lock;
use crate::logger::{elapsed_ms, ActionLogger};
use crate::notifier::NotificationSink;
use crate::provider_manager::ProviderRegistry;
use crate::retry::classify;
use crate::roster::Roster;
use crate::standby::StandbyManager;
use crate::transport::{Location, SyncTransport, TransferStats};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SyncResult {
    pub files_changed: u64,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
}

/// One-way replication of a primary's working directory to its standby
/// and, when configured, to the object store.
pub struct SyncEngine {
    settings: SyncSettings,
    standby: Arc<StandbyManager>,
    roster: Arc<Roster>,
    providers: Arc<ProviderRegistry>,
    transport: Arc<dyn SyncTransport>,
    notifier: Arc<dyn NotificationSink>,
    logger: ActionLogger,
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    next_attempt: Mutex<HashMap<Uuid, Instant>>,
    restore_points: RwLock<HashMap<Uuid, RestorePoint>>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncSettings,
        standby: Arc<StandbyManager>,
        roster: Arc<Roster>,
        providers: Arc<ProviderRegistry>,
        transport: Arc<dyn SyncTransport>,
        notifier: Arc<dyn NotificationSink>,
        logger: ActionLogger,
    ) -> Self {
        Self {
            settings,
            standby,
            roster,
            providers,
            transport,
            notifier,
            logger,
            in_flight: Mutex::new(HashMap::new()),
            next_attempt: Mutex::new(HashMap::new()),
            restore_points: RwLock::new(HashMap::new()),
        }
    }

    pub fn workdir(&self) -> &str {
        &self.settings.workdir
    }

    /// Resolve the remote location of an instance's working directory.
    pub async fn location_of(&self, instance_id: Uuid) -> Result<Location, FleetError> {
        let instance = self
            .roster
            .get(instance_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("instance {}", instance_id)))?;
        let provider = self.providers.get(&instance.provider)?;
        let host = provider
            .get_instance_address(&instance.provider_instance_id)
            .await
            .map_err(|e| classify(&e))?
            .ok_or_else(|| {
                FleetError::TransientProvider(format!("instance {} has no address yet", instance_id))
            })?;
        Ok(Location::Remote {
            host,
            path: self.settings.workdir.clone(),
        })
    }

    /// Run one replication pass now. Fails fast if a pass is already running
    /// for this primary.
    pub async fn sync_now(&self, primary_id: Uuid) -> Result<SyncResult, FleetError> {
        let assoc = self
            .standby
            .get(primary_id)
            .await
            .filter(|a| matches!(a.state, StandbyState::Syncing | StandbyState::Ready));
        let standby_id = assoc.as_ref().and_then(|a| a.standby_id);
        if standby_id.is_none() && self.settings.object_store_uri.is_none() {
            return Err(FleetError::NotFound(format!(
                "no syncing standby or object store for {}",
                primary_id
            )));
        }

        let cancel = {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.contains_key(&primary_id) {
                return Err(FleetError::TransientProvider(format!(
                    "sync already running for {}",
                    primary_id
                )));
            }
            let token = CancellationToken::new();
            in_flight.insert(primary_id, token.clone());
            token
        };

        let start = Instant::now();
        let log_id = self
            .logger
            .log_event("SYNC", "in_progress", primary_id, None)
            .await
            .ok();
        let outcome = self.replicate(primary_id, standby_id, cancel).await;
        lock(&self.in_flight).remove(&primary_id);

        match outcome {
            Ok((stats, source)) => {
                let now = Utc::now();
                if standby_id.is_some() {
                    self.standby.record_sync_success(primary_id, now).await;
                }
                self.restore_points.write().await.insert(
                    primary_id,
                    RestorePoint {
                        primary_id,
                        created_at: now,
                        source,
                        files_changed: stats.files_changed,
                        bytes_transferred: stats.bytes_transferred,
                    },
                );
                lock(&self.next_attempt).insert(primary_id, Instant::now() + self.settings.interval);
                let result = SyncResult {
                    files_changed: stats.files_changed,
                    bytes_transferred: stats.bytes_transferred,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
                tracing::debug!(
                    %primary_id,
                    "🔁 [sync] {} file(s), {} bytes in {}ms",
                    result.files_changed,
                    result.bytes_transferred,
                    result.duration_ms
                );
                if let Some(lid) = log_id {
                    self.logger
                        .log_event_complete_with_metadata(
                            lid,
                            "success",
                            elapsed_ms(start),
                            None,
                            Some(serde_json::json!({
                                "files_changed": result.files_changed,
                                "bytes_transferred": result.bytes_transferred,
                            })),
                        )
                        .await
                        .ok();
                }
                Ok(result)
            }
            Err(err) => {
                if let Some(lid) = log_id {
                    self.logger
                        .log_event_complete(lid, "failed", elapsed_ms(start), Some(&err.to_string()))
                        .await
                        .ok();
                }
                if matches!(err, FleetError::Cancelled(_)) {
                    return Err(err);
                }
                if standby_id.is_some() {
                    if let Some((failures, newly_degraded)) =
                        self.standby.record_sync_failure(primary_id).await
                    {
                        let delay = self.backoff(failures);
                        lock(&self.next_attempt).insert(primary_id, Instant::now() + delay);
                        tracing::warn!(
                            %primary_id,
                            "⚠️ [sync] failure #{} ({}), next attempt in {:?}",
                            failures,
                            err,
                            delay
                        );
                        if newly_degraded {
                            self.notifier
                                .notify(
                                    Severity::Warning,
                                    &format!(
                                        "standby for {} degraded after {} failed syncs; failover may lose data",
                                        primary_id, failures
                                    ),
                                )
                                .await;
                        }
                    }
                }
                Err(err)
            }
        }
    }

    async fn replicate(
        &self,
        primary_id: Uuid,
        standby_id: Option<Uuid>,
        cancel: CancellationToken,
    ) -> Result<(TransferStats, RestoreSource), FleetError> {
        let from = self.location_of(primary_id).await?;
        let mut total = TransferStats::default();
        let mut source = None;

        if let Some(standby_id) = standby_id {
            let to = self.location_of(standby_id).await?;
            let stats = self.transfer(&from, &to, cancel.clone()).await?;
            total.files_changed += stats.files_changed;
            total.bytes_transferred += stats.bytes_transferred;
            if let Some(standby) = self.roster.get(standby_id).await {
                source = Some(RestoreSource::Standby {
                    provider: standby.provider,
                    provider_instance_id: standby.provider_instance_id,
                });
            }
        }

        if let Some(uri) = &self.settings.object_store_uri {
            let uri = format!("{}/{}", uri.trim_end_matches('/'), primary_id);
            let to = Location::ObjectStore { uri: uri.clone() };
            match self.transfer(&from, &to, cancel.clone()).await {
                Ok(stats) => {
                    total.files_changed += stats.files_changed;
                    total.bytes_transferred += stats.bytes_transferred;
                    source.get_or_insert(RestoreSource::ObjectStore { uri });
                }
                // the standby copy already succeeded; the object store leg is best effort
                Err(e) if source.is_some() && !matches!(e, FleetError::Cancelled(_)) => {
                    tracing::warn!(%primary_id, "⚠️ [sync] object store copy failed: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        let source = source.ok_or_else(|| {
            FleetError::NotFound(format!("no sync target for {}", primary_id))
        })?;
        Ok((total, source))
    }

    async fn transfer(
        &self,
        from: &Location,
        to: &Location,
        cancel: CancellationToken,
    ) -> Result<TransferStats, FleetError> {
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled("sync cancelled".to_string()));
        }
        match self.transport.transfer(from, to, cancel.clone()).await {
            Ok(stats) => Ok(stats),
            Err(_) if cancel.is_cancelled() => Err(FleetError::Cancelled("sync cancelled".to_string())),
            Err(e) => Err(classify(&e)),
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = self
            .settings
            .backoff_base
            .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1)));
        exp.min(self.settings.backoff_max)
    }

    /// Abort an in-flight transfer for this primary. Returns whether one was running.
    pub fn cancel(&self, primary_id: Uuid) -> bool {
        match lock(&self.in_flight).get(&primary_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(%primary_id, "🛑 [sync] in-flight transfer cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn latest_restore_point(&self, primary_id: Uuid) -> Option<RestorePoint> {
        self.restore_points.read().await.get(&primary_id).cloned()
    }

    pub async fn forget(&self, primary_id: Uuid) {
        self.restore_points.write().await.remove(&primary_id);
        lock(&self.next_attempt).remove(&primary_id);
    }

    /// Primaries whose association is syncing/ready, whose primary is running,
    /// and whose backoff has elapsed.
    pub async fn due(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut due = Vec::new();
        for assoc in self.standby.list().await {
            if !matches!(assoc.state, StandbyState::Syncing | StandbyState::Ready) {
                continue;
            }
            let running = self
                .roster
                .get(assoc.primary_id)
                .await
                .map(|i| i.status == InstanceStatus::Running)
                .unwrap_or(false);
            if !running {
                continue;
            }
            let ready = lock(&self.next_attempt)
                .get(&assoc.primary_id)
                .map(|t| *t <= now)
                .unwrap_or(true);
            if ready {
                due.push(assoc.primary_id);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderCallSettings, StandbySettings};
    use crate::notifier::MemorySink;
    use crate::transport::memory::MemoryTransport;
    use fleetwarden_common::{GpuSpec, Instance};
    use fleetwarden_providers::mock::MockProvider;

    struct Harness {
        engine: Arc<SyncEngine>,
        standby: Arc<StandbyManager>,
        transport: Arc<MemoryTransport>,
        sink: Arc<MemorySink>,
        primary: Uuid,
    }

    async fn harness(object_store: Option<&str>) -> Harness {
        let cloud = Arc::new(MockProvider::new("mock"));
        cloud.insert_instance("gpu-1", Some("m-1")).await;
        let providers = Arc::new(ProviderRegistry::new().with(cloud));
        let roster = Arc::new(Roster::new());
        let primary = roster
            .insert(Instance::new_gpu(
                "mock",
                "gpu-1",
                GpuSpec {
                    gpu_class: "A100".into(),
                    gpu_rank: 10,
                    gpu_count: 1,
                    vram_gb: 80,
                },
            ))
            .await;
        let calls = ProviderCallSettings {
            timeout: Duration::from_secs(1),
            max_attempts: 1,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(1),
        };
        let standby = Arc::new(StandbyManager::new(
            StandbySettings::default(),
            calls,
            2,
            providers.clone(),
            roster.clone(),
            ActionLogger::default(),
        ));
        let transport = Arc::new(MemoryTransport::new());
        let sink = Arc::new(MemorySink::new());
        let settings = SyncSettings {
            object_store_uri: object_store.map(|s| s.to_string()),
            backoff_base: Duration::from_secs(1),
            ..SyncSettings::default()
        };
        let engine = Arc::new(SyncEngine::new(
            settings,
            standby.clone(),
            roster,
            providers,
            transport.clone(),
            sink.clone(),
            ActionLogger::default(),
        ));
        Harness {
            engine,
            standby,
            transport,
            sink,
            primary,
        }
    }

    #[tokio::test]
    async fn first_successful_sync_makes_standby_ready() {
        let h = harness(None).await;
        h.standby.provision(h.primary).await.unwrap();
        let res = h.engine.sync_now(h.primary).await.unwrap();
        assert_eq!(res.files_changed, 1);
        assert!(h.standby.is_ready(h.primary).await);
        let rp = h.engine.latest_restore_point(h.primary).await.unwrap();
        assert!(matches!(rp.source, RestoreSource::Standby { .. }));
    }

    #[tokio::test]
    async fn repeated_failures_degrade_but_keep_association() {
        let h = harness(None).await;
        h.standby.provision(h.primary).await.unwrap();
        h.engine.sync_now(h.primary).await.unwrap();
        h.transport.set_always_fail(true);
        assert!(h.engine.sync_now(h.primary).await.unwrap_err().is_transient());
        assert!(!h.standby.is_degraded(h.primary).await);
        assert!(h.engine.sync_now(h.primary).await.is_err());
        assert!(h.standby.is_degraded(h.primary).await);
        assert!(h.standby.get(h.primary).await.is_some());
        assert_eq!(h.sink.messages().len(), 1);
        // backing off: not due right away
        assert!(!h.engine.due().await.contains(&h.primary));
    }

    #[tokio::test]
    async fn object_store_only_sync() {
        let h = harness(Some("s3://bucket/fleet/")).await;
        h.engine.sync_now(h.primary).await.unwrap();
        let rp = h.engine.latest_restore_point(h.primary).await.unwrap();
        assert_eq!(
            rp.source,
            RestoreSource::ObjectStore {
                uri: format!("s3://bucket/fleet/{}", h.primary)
            }
        );
    }

    #[tokio::test]
    async fn in_flight_sync_can_be_cancelled() {
        let h = harness(None).await;
        h.standby.provision(h.primary).await.unwrap();
        h.transport.set_delay(Duration::from_secs(30));
        let engine = h.engine.clone();
        let primary = h.primary;
        let task = tokio::spawn(async move { engine.sync_now(primary).await });
        for _ in 0..100 {
            if h.engine.cancel(primary) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let res = task.await.unwrap();
        assert!(matches!(res, Err(FleetError::Cancelled(_))));
        // cancellation is not a sync failure
        assert!(!h.standby.is_degraded(primary).await);
        assert!(h.engine.latest_restore_point(primary).await.is_none());
    }
}
