use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub mod bus;
pub mod error;

pub use error::FleetError;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Gpu,
    CpuStandby,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning, // Request sent to provider
    Running,      // Serving / reporting
    Paused,       // Stopped by us, resumable (cold)
    Hibernated,   // Paused after a best-effort checkpoint
    Orphaned,     // Missed heartbeats, presumed alive
    Lost,         // Presumed reclaimed by the provider
    Destroyed,    // Archived
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Hibernated => "hibernated",
            InstanceStatus::Orphaned => "orphaned",
            InstanceStatus::Lost => "lost",
            InstanceStatus::Destroyed => "destroyed",
        }
    }

    /// Paused and hibernated instances are expected to be silent.
    pub fn is_suspended(&self) -> bool {
        matches!(self, InstanceStatus::Paused | InstanceStatus::Hibernated)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    Healthy,
    Idle,
    Orphaned,
    Lost,
}

impl LivenessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessState::Healthy => "healthy",
            LivenessState::Idle => "idle",
            LivenessState::Orphaned => "orphaned",
            LivenessState::Lost => "lost",
        }
    }
}

/// Output of the decision engine for one instance on one tick.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    None,
    /// `none` carrying an operator/agent advisory.
    Warn { message: String },
    Pause,
    Hibernate,
    Delete { snapshot_first: bool },
    Failover,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Warn { .. } => "warn",
            Action::Pause => "pause",
            Action::Hibernate => "hibernate",
            Action::Delete { .. } => "delete",
            Action::Failover => "failover",
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Action::Pause | Action::Hibernate | Action::Delete { .. } | Action::Failover
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StandbyState {
    Provisioning,
    Syncing,
    Ready,
    FailoverActive,
    Retired,
}

impl StandbyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StandbyState::Provisioning => "provisioning",
            StandbyState::Syncing => "syncing",
            StandbyState::Ready => "ready",
            StandbyState::FailoverActive => "failover_active",
            StandbyState::Retired => "retired",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    Idle,
    GpuLost,
    FailoverActive,
    Searching,
    Provisioning,
    Restoring,
    Complete,
    Failed,
}

impl FailoverPhase {
    /// The only legal forward step; terminal phases have none.
    pub fn next(&self) -> Option<FailoverPhase> {
        match self {
            FailoverPhase::Idle => Some(FailoverPhase::GpuLost),
            FailoverPhase::GpuLost => Some(FailoverPhase::FailoverActive),
            FailoverPhase::FailoverActive => Some(FailoverPhase::Searching),
            FailoverPhase::Searching => Some(FailoverPhase::Provisioning),
            FailoverPhase::Provisioning => Some(FailoverPhase::Restoring),
            FailoverPhase::Restoring => Some(FailoverPhase::Complete),
            FailoverPhase::Complete | FailoverPhase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailoverPhase::Complete | FailoverPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverPhase::Idle => "idle",
            FailoverPhase::GpuLost => "gpu_lost",
            FailoverPhase::FailoverActive => "failover_active",
            FailoverPhase::Searching => "searching",
            FailoverPhase::Provisioning => "provisioning",
            FailoverPhase::Restoring => "restoring",
            FailoverPhase::Complete => "complete",
            FailoverPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityOutcome {
    Success,
    Timeout,
    ProvisioningFailure,
    PrematureTermination,
}

impl ReliabilityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityOutcome::Success => "success",
            ReliabilityOutcome::Timeout => "timeout",
            ReliabilityOutcome::ProvisioningFailure => "provisioning_failure",
            ReliabilityOutcome::PrematureTermination => "premature_termination",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReliabilityOutcome::Success)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    Agent,
    Poll,
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GpuSpec {
    pub gpu_class: String,
    /// Provider-normalised ordering; higher is better.
    pub gpu_rank: u32,
    pub gpu_count: u32,
    pub vram_gb: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Instance {
    pub id: Uuid,
    pub provider: String,
    pub provider_instance_id: String,
    pub kind: InstanceKind,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub hourly_cost: f64,
    pub protected: bool,

    pub zone: Option<String>,
    pub region: Option<String>,
    /// Physical host identifier, used by the reliability ledger.
    pub machine_id: Option<String>,
    pub gpu: Option<GpuSpec>,
    /// True when an in-instance agent pushes heartbeats.
    pub has_agent: bool,
    pub checkpoint_capable: bool,
}

impl Instance {
    pub fn new_gpu(provider: &str, provider_instance_id: &str, gpu: GpuSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            provider_instance_id: provider_instance_id.to_string(),
            kind: InstanceKind::Gpu,
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            hourly_cost: 0.0,
            protected: false,
            zone: None,
            region: None,
            machine_id: None,
            gpu: Some(gpu),
            has_agent: true,
            checkpoint_capable: false,
        }
    }

    /// CPU standby registered on behalf of a primary; always polled, never pushed.
    pub fn new_standby(provider: &str, provider_instance_id: &str) -> Self {
        Self {
            kind: InstanceKind::CpuStandby,
            gpu: None,
            has_agent: false,
            ..Self::new_gpu(
                provider,
                provider_instance_id,
                GpuSpec {
                    gpu_class: String::new(),
                    gpu_rank: 0,
                    gpu_count: 0,
                    vram_gb: 0,
                },
            )
        }
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds() as f64 / 3600.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HeartbeatSample {
    pub instance_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub gpu_utilization_pct: f64,
    pub vram_used_gb: f64,
    pub cost_accumulated: f64,
    pub source: SampleSource,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreSource {
    Standby { provider: String, provider_instance_id: String },
    ObjectStore { uri: String },
    Snapshot { snapshot_ref: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RestorePoint {
    pub primary_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source: RestoreSource,
    pub files_changed: u64,
    pub bytes_transferred: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StandbyAssociation {
    pub id: Uuid,
    pub primary_id: Uuid,
    pub standby_id: Option<Uuid>,
    pub provider: String,
    pub zone: Option<String>,
    pub machine_type: String,
    pub state: StandbyState,
    pub sync_count: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_failures: u32,
    /// Repeated sync failures: restorable, but data may be stale.
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl StandbyAssociation {
    pub fn is_active(&self) -> bool {
        self.state != StandbyState::Retired
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PhaseTransition {
    pub from: FailoverPhase,
    pub to: FailoverPhase,
    pub at: DateTime<Utc>,
    /// Time spent in `from` before this transition.
    pub duration_ms: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReplacementSpec {
    pub provider: String,
    pub offer_id: String,
    pub machine_id: String,
    pub gpu: GpuSpec,
    pub hourly_cost: f64,
    pub region: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FailoverSession {
    pub id: Uuid,
    pub primary_id: Uuid,
    pub phase: FailoverPhase,
    pub started_at: DateTime<Utc>,
    pub phase_entered_at: DateTime<Utc>,
    pub transitions: Vec<PhaseTransition>,
    pub detection_latency_ms: Option<i64>,
    pub failover_time_ms: Option<i64>,
    pub replacement: Option<ReplacementSpec>,
    pub new_primary_id: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub possible_data_loss: bool,
    pub total_recovery_ms: Option<i64>,
    pub synthetic: bool,
}

impl FailoverSession {
    pub fn new(primary_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            primary_id,
            phase: FailoverPhase::Idle,
            started_at: now,
            phase_entered_at: now,
            transitions: Vec::new(),
            detection_latency_ms: None,
            failover_time_ms: None,
            replacement: None,
            new_primary_id: None,
            failure_reason: None,
            possible_data_loss: false,
            total_recovery_ms: None,
            synthetic: false,
        }
    }

    /// Move to `to`. Only the next phase in sequence, or `failed` from a
    /// non-terminal phase, is accepted.
    pub fn advance(&mut self, to: FailoverPhase, now: DateTime<Utc>) -> Result<(), FleetError> {
        let legal = match to {
            FailoverPhase::Failed => !self.phase.is_terminal(),
            _ => self.phase.next() == Some(to),
        };
        if !legal {
            return Err(FleetError::InvalidTransition {
                from: self.phase.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let duration_ms = (now - self.phase_entered_at).num_milliseconds().max(0);
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at: now,
            duration_ms,
        });
        self.phase = to;
        self.phase_entered_at = now;
        if to == FailoverPhase::Complete {
            self.total_recovery_ms = Some(self.transitions.iter().map(|t| t.duration_ms).sum());
        }
        Ok(())
    }

    pub fn phase_sequence(&self) -> Vec<FailoverPhase> {
        let mut out = vec![FailoverPhase::Idle];
        out.extend(self.transitions.iter().map(|t| t.to));
        out
    }

    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReliabilityRecord {
    pub provider: String,
    pub machine_id: String,
    pub outcome: ReliabilityOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Thresholds that drive liveness classification and the decision engine.
/// Built once, swapped whole on reload, passed by reference into every evaluation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Policy {
    pub idle_utilization_threshold_pct: f64,
    pub idle_window_minutes: i64,
    /// Lost after twice this long without a sample.
    pub orphan_after_minutes: i64,
    /// Orphaned after this long without a sample.
    pub orphan_grace_minutes: i64,
    pub delete_after_idle_hours: f64,
    pub min_instance_age_hours: f64,
    pub protected_instance_ids: HashSet<Uuid>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            idle_utilization_threshold_pct: 10.0,
            idle_window_minutes: 30,
            orphan_after_minutes: 15,
            orphan_grace_minutes: 5,
            delete_after_idle_hours: 2.0,
            min_instance_age_hours: 0.25,
            protected_instance_ids: HashSet::new(),
        }
    }
}

/// Longest accepted policy threshold, ten years.
pub const MAX_POLICY_MINUTES: i64 = 10 * 365 * 24 * 60;

/// Minutes as a duration; out-of-range values saturate to "never".
fn minutes(m: i64) -> Duration {
    Duration::try_minutes(m).unwrap_or(Duration::MAX)
}

impl Policy {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.idle_utilization_threshold_pct) {
            return Err(format!(
                "idle_utilization_threshold_pct out of range: {}",
                self.idle_utilization_threshold_pct
            ));
        }
        for (name, value) in [
            ("idle_window_minutes", self.idle_window_minutes),
            ("orphan_after_minutes", self.orphan_after_minutes),
            ("orphan_grace_minutes", self.orphan_grace_minutes),
        ] {
            if value <= 0 || value > MAX_POLICY_MINUTES {
                return Err(format!("{} must be in 1..={}: {}", name, MAX_POLICY_MINUTES, value));
            }
        }
        if self.orphan_after_minutes * 2 <= self.orphan_grace_minutes {
            return Err("lost threshold must exceed orphan grace".to_string());
        }
        let max_hours = (MAX_POLICY_MINUTES / 60) as f64;
        for (name, value) in [
            ("delete_after_idle_hours", self.delete_after_idle_hours),
            ("min_instance_age_hours", self.min_instance_age_hours),
        ] {
            if !(0.0..=max_hours).contains(&value) {
                return Err(format!("{} must be in 0..={}: {}", name, max_hours, value));
            }
        }
        Ok(())
    }

    /// Silence after which an instance is lost.
    pub fn lost_after(&self) -> Duration {
        minutes(self.orphan_after_minutes.saturating_mul(2))
    }

    /// Silence after which an instance is orphaned.
    pub fn orphan_grace(&self) -> Duration {
        minutes(self.orphan_grace_minutes)
    }

    pub fn idle_window(&self) -> Duration {
        minutes(self.idle_window_minutes)
    }

    /// Cumulative lost/idle time before a lost instance without standby is deleted.
    pub fn delete_after(&self) -> Duration {
        let secs = self.delete_after_idle_hours * 3600.0;
        if secs.is_nan() {
            return Duration::MAX;
        }
        // float-to-int casts saturate
        Duration::try_seconds(secs.max(0.0) as i64).unwrap_or(Duration::MAX)
    }

    pub fn is_protected(&self, instance: &Instance) -> bool {
        instance.protected || self.protected_instance_ids.contains(&instance.id)
    }
}
