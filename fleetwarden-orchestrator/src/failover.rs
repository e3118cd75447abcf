//! Failover sessions: `idle -> gpu_lost -> failover_active -> searching ->
//! provisioning -> restoring -> complete`, or `failed` from any non-terminal
//! phase. One active session per primary; a second request is rejected with
//! `ConcurrentSession`, never queued.
//!
//! Cancellation interrupts search, reachability waits, restore transfers and
//! the health wait immediately. A provider `provision` call in flight is
//! allowed to return first so the resource it created can be torn down.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fleetwarden_common::bus::Severity;
use fleetwarden_common::{
    FailoverPhase, FailoverSession, FleetError, GpuSpec, Instance, InstanceKind, InstanceStatus,
    ReliabilityOutcome, ReplacementSpec, RestoreSource,
};
use fleetwarden_providers::inventory::{GpuOffer, MachineClass, OfferQuery, ProvisionSpec};
use fleetwarden_providers::{CloudProvider, SnapshotService};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{FailoverSettings, ProviderCallSettings};
use crate::lock;
use crate::logger::{elapsed_ms, ActionLogger};
use crate::notifier::NotificationSink;
use crate::provider_manager::ProviderRegistry;
use crate::reliability::ReliabilityLedger;
use crate::retry::{backoff_delay, call_with_retry, classify};
use crate::roster::Roster;
use crate::sample_store::SampleStore;
use crate::sampler::{self, SampleOutcome};
use crate::standby::StandbyManager;
use crate::state_machine;
use crate::sync_engine::SyncEngine;
use crate::transport::{Location, SyncTransport};

/// Shared components a session drives.
#[derive(Clone)]
pub struct FailoverComponents {
    pub roster: Arc<Roster>,
    pub samples: Arc<SampleStore>,
    pub providers: Arc<ProviderRegistry>,
    pub snapshots: Option<Arc<dyn SnapshotService>>,
    pub ledger: Arc<ReliabilityLedger>,
    pub standby: Arc<StandbyManager>,
    pub sync: Arc<SyncEngine>,
    pub transport: Arc<dyn SyncTransport>,
    pub notifier: Arc<dyn NotificationSink>,
    pub logger: ActionLogger,
}

#[derive(Clone)]
struct SessionHandle {
    session_id: Uuid,
    cancel: CancellationToken,
}

struct Candidate {
    provider: Arc<dyn CloudProvider>,
    offer: GpuOffer,
    score: f64,
}

/// Mutable state of one drive, used for teardown on failure.
struct Run {
    session_id: Uuid,
    primary_id: Uuid,
    replacement: Option<Uuid>,
}

pub struct FailoverOrchestrator {
    settings: FailoverSettings,
    calls: ProviderCallSettings,
    c: FailoverComponents,
    sessions: Mutex<HashMap<Uuid, FailoverSession>>,
    active: Mutex<HashMap<Uuid, SessionHandle>>,
    cancel_reasons: Mutex<HashMap<Uuid, String>>,
    recent_starts: Mutex<VecDeque<DateTime<Utc>>>,
}

impl FailoverOrchestrator {
    pub fn new(settings: FailoverSettings, calls: ProviderCallSettings, components: FailoverComponents) -> Self {
        Self {
            settings,
            calls,
            c: components,
            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            cancel_reasons: Mutex::new(HashMap::new()),
            recent_starts: Mutex::new(VecDeque::new()),
        }
    }

    // ------------------------------------------------------------------
    // Session registry
    // ------------------------------------------------------------------

    pub fn has_active(&self, primary_id: Uuid) -> bool {
        lock(&self.active).contains_key(&primary_id)
    }

    pub fn active_session(&self, primary_id: Uuid) -> Option<FailoverSession> {
        let session_id = lock(&self.active).get(&primary_id)?.session_id;
        self.session(session_id)
    }

    pub fn session(&self, session_id: Uuid) -> Option<FailoverSession> {
        lock(&self.sessions).get(&session_id).cloned()
    }

    /// Newest first.
    pub fn sessions(&self) -> Vec<FailoverSession> {
        let mut out: Vec<FailoverSession> = lock(&self.sessions).values().cloned().collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        out
    }

    async fn begin(&self, primary_id: Uuid, synthetic: bool) -> Result<(Uuid, CancellationToken), FleetError> {
        let primary = self
            .c
            .roster
            .get(primary_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("instance {}", primary_id)))?;
        if primary.kind != InstanceKind::Gpu || primary.status == InstanceStatus::Destroyed {
            return Err(FleetError::PolicyViolation(format!(
                "instance {} is not a failover candidate",
                primary_id
            )));
        }

        let now = Utc::now();
        let mut session = FailoverSession::new(primary_id, now);
        session.synthetic = synthetic;
        let handle = SessionHandle {
            session_id: session.id,
            cancel: CancellationToken::new(),
        };
        {
            let mut active = lock(&self.active);
            if active.contains_key(&primary_id) {
                tracing::info!(%primary_id, "⏭️ [failover] session already active, ignoring duplicate");
                return Err(FleetError::ConcurrentSession(primary_id));
            }
            active.insert(primary_id, handle.clone());
            lock(&self.sessions).insert(session.id, session.clone());
        }

        tracing::warn!(
            %primary_id,
            session_id = %session.id,
            synthetic,
            "🚑 [failover] session started"
        );
        self.note_start(now).await;
        Ok((session.id, handle.cancel))
    }

    /// Start a session and drive it in the background.
    pub async fn start(self: &Arc<Self>, primary_id: Uuid) -> Result<Uuid, FleetError> {
        let (session_id, cancel) = self.begin(primary_id, false).await?;
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(session_id, primary_id, cancel).await;
        });
        Ok(session_id)
    }

    /// Test-only entry point: inject a synthetic `gpu_lost` for a primary.
    pub async fn simulate_gpu_lost(self: &Arc<Self>, primary_id: Uuid) -> Result<Uuid, FleetError> {
        let (session_id, cancel) = self.begin(primary_id, true).await?;
        let this = self.clone();
        tokio::spawn(async move {
            this.drive(session_id, primary_id, cancel).await;
        });
        Ok(session_id)
    }

    /// Start a session and wait for its terminal state.
    pub async fn run_to_completion(&self, primary_id: Uuid) -> Result<FailoverSession, FleetError> {
        let (session_id, cancel) = self.begin(primary_id, false).await?;
        self.drive(session_id, primary_id, cancel)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("session {}", session_id)))
    }

    /// Cancel the active session for a primary (or by session id).
    pub fn cancel(&self, id: Uuid, reason: &str) -> Result<Uuid, FleetError> {
        let handle = {
            let active = lock(&self.active);
            active
                .get(&id)
                .or_else(|| active.values().find(|h| h.session_id == id))
                .cloned()
        }
        .ok_or_else(|| FleetError::NotFound(format!("no active failover session for {}", id)))?;
        lock(&self.cancel_reasons).insert(handle.session_id, reason.to_string());
        handle.cancel.cancel();
        tracing::warn!(session_id = %handle.session_id, "🛑 [failover] cancellation requested: {}", reason);
        Ok(handle.session_id)
    }

    async fn note_start(&self, now: DateTime<Utc>) {
        let count = {
            let mut starts = lock(&self.recent_starts);
            starts.push_back(now);
            let cutoff = now - chrono::Duration::hours(1);
            while starts.front().map(|t| *t < cutoff).unwrap_or(false) {
                starts.pop_front();
            }
            starts.len()
        };
        if count > self.settings.alert_failovers_per_hour {
            self.c
                .notifier
                .notify(Severity::Critical, &format!("{} failovers in 1 hour", count))
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    async fn drive(&self, session_id: Uuid, primary_id: Uuid, cancel: CancellationToken) -> Option<FailoverSession> {
        let mut run = Run {
            session_id,
            primary_id,
            replacement: None,
        };
        if let Err(err) = self.execute(&mut run, &cancel).await {
            self.fail(&mut run, err).await;
        }
        lock(&self.active).remove(&primary_id);
        lock(&self.cancel_reasons).remove(&session_id);
        self.session(session_id)
    }

    async fn advance<F>(&self, session_id: Uuid, to: FailoverPhase, f: F) -> Result<FailoverSession, FleetError>
    where
        F: FnOnce(&mut FailoverSession),
    {
        let session = {
            let mut sessions = lock(&self.sessions);
            let s = sessions
                .get_mut(&session_id)
                .ok_or_else(|| FleetError::NotFound(format!("session {}", session_id)))?;
            s.advance(to, Utc::now())?;
            f(s);
            s.clone()
        };
        let spent = session.transitions.last().map(|t| t.duration_ms).unwrap_or(0);
        tracing::info!(
            primary_id = %session.primary_id,
            %session_id,
            "➡️ [failover] {} ({}ms in previous phase)",
            to.as_str(),
            spent
        );
        if let Some(lid) = self
            .c
            .logger
            .log_event_with_metadata(
                "FAILOVER_PHASE",
                "in_progress",
                session.primary_id,
                None,
                Some(serde_json::json!({
                    "session_id": session_id,
                    "phase": to.as_str(),
                    "previous_phase_ms": spent,
                })),
            )
            .await
            .ok()
        {
            self.c.logger.log_event_complete(lid, "success", 0, None).await.ok();
        }
        Ok(session)
    }

    fn update_session<F: FnOnce(&mut FailoverSession)>(&self, session_id: Uuid, f: F) {
        if let Some(s) = lock(&self.sessions).get_mut(&session_id) {
            f(s);
        }
    }

    fn cancelled_error(&self, session_id: Uuid) -> FleetError {
        let reason = lock(&self.cancel_reasons)
            .get(&session_id)
            .cloned()
            .unwrap_or_else(|| "operator cancelled".to_string());
        FleetError::Cancelled(reason)
    }

    fn check_cancel(&self, session_id: Uuid, cancel: &CancellationToken) -> Result<(), FleetError> {
        if cancel.is_cancelled() {
            return Err(self.cancelled_error(session_id));
        }
        Ok(())
    }

    async fn guarded<T, Fut>(&self, session_id: Uuid, cancel: &CancellationToken, fut: Fut) -> Result<T, FleetError>
    where
        Fut: Future<Output = Result<T, FleetError>>,
    {
        tokio::select! {
            res = fut => res,
            _ = cancel.cancelled() => Err(self.cancelled_error(session_id)),
        }
    }

    async fn execute(&self, run: &mut Run, cancel: &CancellationToken) -> Result<(), FleetError> {
        let primary = self
            .c
            .roster
            .get(run.primary_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("instance {}", run.primary_id)))?;
        let tracking = self.c.roster.tracking(primary.id).await.unwrap_or_default();

        // gpu_lost
        let last_seen = self
            .c
            .samples
            .last_seen(primary.id)
            .await
            .unwrap_or(primary.created_at);
        let session = self
            .advance(run.session_id, FailoverPhase::GpuLost, |s| {
                s.detection_latency_ms = Some((s.started_at - last_seen).num_milliseconds().max(0));
            })
            .await?;
        state_machine::mark_lost(&self.c.roster, &self.c.logger, primary.id, "failover: gpu lost").await?;
        if !session.synthetic && !tracking.provider_terminated {
            if let Some(machine) = &primary.machine_id {
                self.c
                    .ledger
                    .record(&primary.provider, machine, ReliabilityOutcome::PrematureTermination)
                    .await;
            }
        }
        self.check_cancel(run.session_id, cancel)?;

        // failover_active
        let assoc = self.c.standby.mark_failover_active(primary.id).await;
        let degraded = assoc.as_ref().map(|a| a.degraded).unwrap_or(false);
        self.advance(run.session_id, FailoverPhase::FailoverActive, |s| {
            s.failover_time_ms = Some((Utc::now() - s.started_at).num_milliseconds().max(0));
            if degraded {
                s.possible_data_loss = true;
            }
        })
        .await?;
        if degraded {
            let stale = FleetError::StaleData(format!("standby for {} missed repeated syncs", primary.id));
            self.c
                .notifier
                .notify(Severity::Warning, &format!("failover proceeding with possible data loss: {}", stale))
                .await;
        }
        self.check_cancel(run.session_id, cancel)?;

        // searching
        self.advance(run.session_id, FailoverPhase::Searching, |_| {}).await?;
        let search = async {
            match tokio::time::timeout(self.settings.search_timeout, self.search(&primary)).await {
                Ok(found) => Ok(found),
                Err(_) => Err(FleetError::TransientProvider(format!(
                    "offer search timed out after {}s",
                    self.settings.search_timeout.as_secs()
                ))),
            }
        };
        let candidates = self.guarded(run.session_id, cancel, search).await?;
        if candidates.is_empty() {
            return Err(FleetError::PermanentProvider(
                "no replacement offer matches the original GPU spec".to_string(),
            ));
        }

        // provisioning
        self.advance(run.session_id, FailoverPhase::Provisioning, |_| {}).await?;
        let new_id = self.provision_replacement(run, &primary, candidates, cancel).await?;

        // restoring
        self.advance(run.session_id, FailoverPhase::Restoring, |_| {}).await?;
        let restore = async {
            match tokio::time::timeout(self.settings.restore_timeout, self.restore(run.session_id, &primary, new_id, cancel)).await {
                Ok(res) => res,
                Err(_) => Err(FleetError::PermanentProvider(format!(
                    "restore timed out after {}s",
                    self.settings.restore_timeout.as_secs()
                ))),
            }
        };
        self.guarded(run.session_id, cancel, restore).await?;

        // complete: first sample from the replacement
        self.guarded(run.session_id, cancel, self.await_first_sample(new_id)).await?;
        self.check_cancel(run.session_id, cancel)?;
        let session = self
            .advance(run.session_id, FailoverPhase::Complete, |s| {
                s.new_primary_id = Some(new_id);
            })
            .await?;
        run.replacement = None;
        self.cutover(&primary, new_id, &session).await;
        Ok(())
    }

    async fn search(&self, primary: &Instance) -> Vec<Candidate> {
        let spec = primary.gpu.clone().unwrap_or(GpuSpec {
            gpu_class: String::new(),
            gpu_rank: 0,
            gpu_count: 1,
            vram_gb: 0,
        });
        let query = OfferQuery {
            min_gpu_rank: spec.gpu_rank,
            min_vram_gb: spec.vram_gb,
            gpu_count: spec.gpu_count.max(1),
            region: primary.region.clone(),
        };

        let mut candidates = Vec::new();
        for provider in self.c.providers.all() {
            let offers = call_with_retry(&self.calls, "search_offers", || {
                let provider = provider.clone();
                let query = query.clone();
                async move { provider.search_offers(&query).await }
            })
            .await;
            let offers = match offers {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!("⚠️ [failover] offer search on {} failed: {}", provider.name(), e);
                    continue;
                }
            };
            for offer in offers {
                if offer.gpu_rank < query.min_gpu_rank
                    || offer.vram_gb < query.min_vram_gb
                    || offer.gpu_count < query.gpu_count
                {
                    continue;
                }
                if provider.name().eq_ignore_ascii_case(&primary.provider)
                    && primary.machine_id.as_deref() == Some(offer.machine_id.as_str())
                {
                    continue;
                }
                if self.c.ledger.is_blacklisted(provider.name(), &offer.machine_id).await {
                    tracing::info!(
                        "⛔ [failover] skipping blacklisted machine {}/{}",
                        provider.name(),
                        offer.machine_id
                    );
                    continue;
                }
                let score = self.c.ledger.score(provider.name(), &offer.machine_id).await;
                candidates.push(Candidate {
                    provider: provider.clone(),
                    offer,
                    score,
                });
            }
        }
        candidates.sort_by(|a, b| {
            a.offer
                .hourly_cost
                .partial_cmp(&b.offer.hourly_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
        });
        tracing::info!(primary_id = %primary.id, "🔎 [failover] {} candidate offer(s)", candidates.len());
        candidates
    }

    async fn provision_replacement(
        &self,
        run: &mut Run,
        primary: &Instance,
        candidates: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Result<Uuid, FleetError> {
        let mut last_err: Option<FleetError> = None;
        let mut tried = 0usize;

        for candidate in candidates.into_iter().take(self.settings.max_provision_attempts) {
            self.check_cancel(run.session_id, cancel)?;
            tried += 1;
            let Candidate { provider, offer, .. } = candidate;
            let provider_name = provider.name().to_string();
            let gpu = GpuSpec {
                gpu_class: offer.gpu_class.clone(),
                gpu_rank: offer.gpu_rank,
                gpu_count: offer.gpu_count,
                vram_gb: offer.vram_gb,
            };
            self.update_session(run.session_id, |s| {
                s.replacement = Some(ReplacementSpec {
                    provider: provider_name.clone(),
                    offer_id: offer.offer_id.clone(),
                    machine_id: offer.machine_id.clone(),
                    gpu: gpu.clone(),
                    hourly_cost: offer.hourly_cost,
                    region: offer.region.clone(),
                });
            });

            let spec = ProvisionSpec {
                class: MachineClass::Gpu,
                offer_or_type: offer.offer_id.clone(),
                zone: offer.region.clone(),
                label: format!("failover-{}", primary.id),
            };
            let start = std::time::Instant::now();
            let attempt = tokio::time::timeout(
                self.settings.provision_timeout,
                call_with_retry(&self.calls, "failover provision", || {
                    let provider = provider.clone();
                    let spec = spec.clone();
                    async move { provider.provision(&spec).await }
                }),
            )
            .await;

            let provisioned = match attempt {
                Err(_) => {
                    self.c
                        .ledger
                        .record(&provider_name, &offer.machine_id, ReliabilityOutcome::Timeout)
                        .await;
                    tracing::warn!("⏱️ [failover] provisioning {} timed out", offer.offer_id);
                    self.sweep_unclaimed(&provider, &spec.label).await;
                    last_err = Some(FleetError::TransientProvider(format!(
                        "provisioning {} timed out",
                        offer.offer_id
                    )));
                    continue;
                }
                Ok(Err(e)) => {
                    self.c
                        .ledger
                        .record(&provider_name, &offer.machine_id, ReliabilityOutcome::ProvisioningFailure)
                        .await;
                    if !e.is_transient() {
                        return Err(e);
                    }
                    tracing::warn!("⚠️ [failover] provisioning {} failed: {}", offer.offer_id, e);
                    // retried attempts may have timed out after the vendor created the machine
                    self.sweep_unclaimed(&provider, &spec.label).await;
                    last_err = Some(e);
                    continue;
                }
                Ok(Ok(p)) => p,
            };

            let mut replacement = Instance::new_gpu(&provider_name, &provisioned.provider_instance_id, gpu);
            replacement.status = InstanceStatus::Provisioning;
            replacement.hourly_cost = provisioned.hourly_cost;
            replacement.zone = provisioned.zone.clone();
            replacement.region = offer.region.clone().or_else(|| primary.region.clone());
            replacement.machine_id = provisioned.machine_id.clone().or(Some(offer.machine_id.clone()));
            replacement.has_agent = primary.has_agent;
            replacement.protected = primary.protected;
            replacement.checkpoint_capable = provider.supports_checkpoint();
            let new_id = self.c.roster.insert(replacement).await;
            run.replacement = Some(new_id);
            self.check_cancel(run.session_id, cancel)?;

            let reachable = self
                .guarded(run.session_id, cancel, self.wait_reachable(&provider, &provisioned.provider_instance_id))
                .await?;
            if reachable {
                self.c
                    .ledger
                    .record(&provider_name, &offer.machine_id, ReliabilityOutcome::Success)
                    .await;
                tracing::info!(
                    primary_id = %primary.id,
                    %new_id,
                    "🆕 [failover] replacement {} on {} reachable after {}ms",
                    provisioned.provider_instance_id,
                    provider_name,
                    elapsed_ms(start)
                );
                return Ok(new_id);
            }

            self.c
                .ledger
                .record(&provider_name, &offer.machine_id, ReliabilityOutcome::Timeout)
                .await;
            self.teardown_replacement(new_id).await;
            run.replacement = None;
            last_err = Some(FleetError::TransientProvider(format!(
                "replacement {} never became reachable",
                provisioned.provider_instance_id
            )));
        }

        Err(FleetError::PermanentProvider(format!(
            "provisioning exhausted after {} candidate(s): {}",
            tried,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn wait_reachable(
        &self,
        provider: &Arc<dyn CloudProvider>,
        provider_instance_id: &str,
    ) -> Result<bool, FleetError> {
        let deadline = tokio::time::Instant::now() + self.settings.provision_timeout;
        loop {
            match provider.is_reachable(provider_instance_id).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => tracing::debug!("🔌 [failover] reachability probe failed: {}", e),
            }
            if tokio::time::Instant::now() + self.settings.health_poll_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.settings.health_poll_interval).await;
        }
    }

    async fn restore(
        &self,
        session_id: Uuid,
        primary: &Instance,
        new_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), FleetError> {
        let point = self.c.sync.latest_restore_point(primary.id).await;
        let source = match point {
            Some(p) => Some(p.source),
            None => self
                .c
                .roster
                .tracking(primary.id)
                .await
                .and_then(|t| t.snapshot_ref)
                .map(|snapshot_ref| RestoreSource::Snapshot { snapshot_ref }),
        };
        let Some(source) = source else {
            self.update_session(session_id, |s| s.possible_data_loss = true);
            self.c
                .notifier
                .notify(
                    Severity::Warning,
                    &format!("no restore point for {}; replacement starts empty", primary.id),
                )
                .await;
            return Ok(());
        };

        let start = std::time::Instant::now();
        let log_id = self
            .c
            .logger
            .log_event_with_metadata(
                "FAILOVER_RESTORE",
                "in_progress",
                primary.id,
                None,
                Some(serde_json::json!({ "source": source, "target": new_id })),
            )
            .await
            .ok();

        let res = match &source {
            RestoreSource::Snapshot { snapshot_ref } => {
                let svc = self.c.snapshots.clone().ok_or_else(|| {
                    FleetError::PermanentProvider("no snapshot service configured".to_string())
                })?;
                let target = self
                    .c
                    .roster
                    .get(new_id)
                    .await
                    .ok_or_else(|| FleetError::NotFound(format!("instance {}", new_id)))?;
                self.with_restore_retry(|| {
                    let svc = svc.clone();
                    let snapshot_ref = snapshot_ref.clone();
                    let pid = target.provider_instance_id.clone();
                    async move { svc.restore_snapshot(&snapshot_ref, &pid).await }
                })
                .await
            }
            RestoreSource::Standby {
                provider,
                provider_instance_id,
            } => {
                let standby_id = self
                    .c
                    .roster
                    .find_by_provider_id(provider, provider_instance_id)
                    .await
                    .ok_or_else(|| FleetError::StaleData("standby no longer registered".to_string()))?;
                let from = self.c.sync.location_of(standby_id).await?;
                let to = self.c.sync.location_of(new_id).await?;
                self.transfer_with_retry(&from, &to, cancel).await
            }
            RestoreSource::ObjectStore { uri } => {
                let from = Location::ObjectStore { uri: uri.clone() };
                let to = self.c.sync.location_of(new_id).await?;
                self.transfer_with_retry(&from, &to, cancel).await
            }
        };

        if let Some(lid) = log_id {
            let (status, err) = match &res {
                Ok(()) => ("success", None),
                Err(e) => ("failed", Some(e.to_string())),
            };
            self.c
                .logger
                .log_event_complete(lid, status, elapsed_ms(start), err.as_deref())
                .await
                .ok();
        }
        res
    }

    async fn transfer_with_retry(
        &self,
        from: &Location,
        to: &Location,
        cancel: &CancellationToken,
    ) -> Result<(), FleetError> {
        self.with_restore_retry(|| {
            let transport = self.c.transport.clone();
            let (from, to, cancel) = (from.clone(), to.clone(), cancel.child_token());
            async move { transport.transfer(&from, &to, cancel).await.map(|_| ()) }
        })
        .await
    }

    async fn with_restore_retry<F, Fut>(&self, mut f: F) -> Result<(), FleetError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match f().await {
                Ok(()) => return Ok(()),
                Err(e) => classify(&e),
            };
            if !err.is_transient() || attempt >= self.calls.max_attempts {
                return Err(err);
            }
            tokio::time::sleep(backoff_delay(&self.calls, attempt)).await;
        }
    }

    async fn await_first_sample(&self, new_id: Uuid) -> Result<(), FleetError> {
        let deadline = tokio::time::Instant::now() + self.settings.health_timeout;
        loop {
            if self.c.samples.last_seen(new_id).await.is_some() {
                return Ok(());
            }
            // agent heartbeats may lag; fall back to a provider metrics poll
            if let Some(instance) = self.c.roster.get(new_id).await {
                if let Ok(provider) = self.c.providers.get(&instance.provider) {
                    let outcome = sampler::sample_instance(
                        provider.as_ref(),
                        &self.c.samples,
                        &instance,
                        self.calls.timeout,
                        Utc::now(),
                    )
                    .await;
                    if outcome == SampleOutcome::Recorded {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() + self.settings.health_poll_interval > deadline {
                if let Some(instance) = self.c.roster.get(new_id).await {
                    if let Some(machine) = &instance.machine_id {
                        self.c
                            .ledger
                            .record(&instance.provider, machine, ReliabilityOutcome::Timeout)
                            .await;
                    }
                }
                return Err(FleetError::PermanentProvider(format!(
                    "replacement {} did not report healthy within {}s",
                    new_id,
                    self.settings.health_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.settings.health_poll_interval).await;
        }
    }

    /// Promote the replacement and clean up after the lost primary.
    async fn cutover(&self, primary: &Instance, new_id: Uuid, session: &FailoverSession) {
        let reason = format!("failover session {}", session.id);
        if let Err(e) = state_machine::mark_running(&self.c.roster, &self.c.logger, new_id, &reason).await {
            tracing::warn!(%new_id, "⚠️ [failover] could not promote replacement: {}", e);
        }

        let terminated = self
            .c
            .roster
            .tracking(primary.id)
            .await
            .map(|t| t.provider_terminated)
            .unwrap_or(false);
        if !terminated {
            if let Ok(provider) = self.c.providers.get(&primary.provider) {
                let pid = primary.provider_instance_id.clone();
                let res = call_with_retry(&self.calls, "destroy lost primary", || {
                    let provider = provider.clone();
                    let pid = pid.clone();
                    async move { provider.destroy(&pid).await }
                })
                .await;
                if let Err(e) = res {
                    tracing::warn!(primary_id = %primary.id, "⚠️ [failover] destroy of lost primary failed: {}", e);
                }
            }
        }
        state_machine::mark_destroyed(&self.c.roster, &self.c.logger, primary.id, &reason)
            .await
            .ok();
        self.c.sync.cancel(primary.id);
        self.c.sync.forget(primary.id).await;
        self.c.samples.forget(primary.id).await;
        if let Err(e) = self.c.standby.teardown_for(primary.id, "promoted by failover").await {
            tracing::warn!(primary_id = %primary.id, "⚠️ [failover] old standby teardown failed: {}", e);
        }

        self.c
            .notifier
            .notify(
                Severity::Info,
                &format!(
                    "failover for {} complete in {}ms, new primary {}",
                    primary.id,
                    session.total_recovery_ms.unwrap_or(0),
                    new_id
                ),
            )
            .await;

        if self.settings.continuous_protection {
            let standby = self.c.standby.clone();
            let sync = self.c.sync.clone();
            tokio::spawn(async move {
                match standby.provision(new_id).await {
                    Ok(_) => {
                        if let Err(e) = sync.sync_now(new_id).await {
                            tracing::warn!(%new_id, "⚠️ [failover] initial sync to new standby failed: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!(%new_id, "⚠️ [failover] new standby provisioning failed: {}", e),
                }
            });
        }
    }

    /// Destroy provider instances carrying this session's label that never made
    /// it into the roster. A provision call dropped on timeout can still have
    /// created a machine on the vendor side.
    async fn sweep_unclaimed(&self, provider: &Arc<dyn CloudProvider>, label: &str) -> usize {
        let listed = match call_with_retry(&self.calls, "list for sweep", || {
            let provider = provider.clone();
            async move { provider.list_instances().await }
        })
        .await
        {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("⚠️ [failover] cannot list {} to sweep '{}': {}", provider.name(), label, e);
                return 0;
            }
        };

        let mut swept = 0;
        for d in listed.into_iter().filter(|d| d.name == label) {
            if self
                .c
                .roster
                .find_by_provider_id(provider.name(), &d.provider_instance_id)
                .await
                .is_some()
            {
                continue;
            }
            let pid = d.provider_instance_id.clone();
            let res = call_with_retry(&self.calls, "destroy unclaimed", || {
                let provider = provider.clone();
                let pid = pid.clone();
                async move { provider.destroy(&pid).await }
            })
            .await;
            match res {
                Ok(_) => {
                    tracing::warn!("🧹 [failover] destroyed unclaimed {} on {}", pid, provider.name());
                    swept += 1;
                }
                Err(e) => {
                    self.c
                        .notifier
                        .notify(
                            Severity::Critical,
                            &format!("unclaimed instance {} on {} could not be destroyed: {}", pid, provider.name(), e),
                        )
                        .await;
                }
            }
        }
        swept
    }

    async fn teardown_replacement(&self, instance_id: Uuid) {
        let Some(instance) = self.c.roster.get(instance_id).await else {
            return;
        };
        if instance.status == InstanceStatus::Destroyed {
            return;
        }
        if let Ok(provider) = self.c.providers.get(&instance.provider) {
            let pid = instance.provider_instance_id.clone();
            let res = call_with_retry(&self.calls, "destroy replacement", || {
                let provider = provider.clone();
                let pid = pid.clone();
                async move { provider.destroy(&pid).await }
            })
            .await;
            if let Err(e) = res {
                tracing::error!(
                    %instance_id,
                    "❌ [failover] replacement {} could not be destroyed: {}",
                    instance.provider_instance_id,
                    e
                );
                self.c
                    .notifier
                    .notify(
                        Severity::Critical,
                        &format!(
                            "replacement {} on {} leaked after failed failover: {}",
                            instance.provider_instance_id, instance.provider, e
                        ),
                    )
                    .await;
            }
        }
        state_machine::mark_destroyed(&self.c.roster, &self.c.logger, instance_id, "failover teardown")
            .await
            .ok();
    }

    async fn fail(&self, run: &mut Run, err: FleetError) {
        if let Some(new_id) = run.replacement.take() {
            self.teardown_replacement(new_id).await;
        }
        let reason = err.to_string();
        let now = Utc::now();
        let failed = {
            let mut sessions = lock(&self.sessions);
            match sessions.get_mut(&run.session_id) {
                Some(s) if s.is_active() => {
                    if let Err(e) = s.advance(FailoverPhase::Failed, now) {
                        tracing::error!("❌ [failover] could not mark session failed: {}", e);
                    }
                    s.failure_reason = Some(reason.clone());
                    Some(s.phase_sequence())
                }
                _ => None,
            }
        };
        tracing::error!(
            primary_id = %run.primary_id,
            session_id = %run.session_id,
            phases = ?failed,
            "❌ [failover] session failed: {}",
            reason
        );
        self.c
            .logger
            .log_event(
                "FAILOVER_FAILED",
                "failed",
                run.primary_id,
                Some(&reason),
            )
            .await
            .ok();
        self.c
            .notifier
            .notify(
                Severity::Critical,
                &format!(
                    "failover for {} failed ({}); operator attention required",
                    run.primary_id, reason
                ),
            )
            .await;
    }
}
