//! Liveness classification. Pure functions over time-since-last-sample and the
//! rolling utilization window; nothing here reads clocks or shared state.

use chrono::{DateTime, Utc};
use fleetwarden_common::{HeartbeatSample, Instance, LivenessState, Policy};

/// Fewer samples than this inside the idle window never classify as idle.
pub const MIN_IDLE_SAMPLES: usize = 5;

/// Rules, in priority order:
/// 1. silence > 2 x `orphan_after_minutes` -> lost
/// 2. silence > `orphan_grace_minutes` -> orphaned
/// 3. fewer than `MIN_IDLE_SAMPLES` in the idle window -> healthy
/// 4. every sample in the window below the threshold -> idle
/// 5. otherwise healthy
///
/// An empty slice carries no evidence either way and classifies as healthy;
/// use [`classify_instance`] when a fallback anchor is known.
pub fn classify(now: DateTime<Utc>, samples: &[HeartbeatSample], policy: &Policy) -> LivenessState {
    match samples.last() {
        Some(last) => classify_from(now, last.timestamp, samples, policy),
        None => LivenessState::Healthy,
    }
}

fn classify_from(
    now: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    samples: &[HeartbeatSample],
    policy: &Policy,
) -> LivenessState {
    let silence = now - last_seen;
    if silence > policy.lost_after() {
        return LivenessState::Lost;
    }
    if silence > policy.orphan_grace() {
        return LivenessState::Orphaned;
    }

    let window_start = now
        .checked_sub_signed(policy.idle_window())
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let window: Vec<&HeartbeatSample> = samples
        .iter()
        .filter(|s| s.timestamp >= window_start)
        .collect();
    if window.len() < MIN_IDLE_SAMPLES {
        return LivenessState::Healthy;
    }
    // One spike anywhere in the window keeps the instance healthy.
    if window
        .iter()
        .all(|s| s.gpu_utilization_pct < policy.idle_utilization_threshold_pct)
    {
        LivenessState::Idle
    } else {
        LivenessState::Healthy
    }
}

/// Inputs beyond the sample window that affect one instance's liveness.
#[derive(Debug, Clone, Default)]
pub struct LivenessContext {
    /// Provider no longer lists the instance.
    pub provider_terminated: bool,
    /// Most recent resume/creation-like event; silence is measured from here
    /// when no newer sample exists, and older samples are ignored.
    pub anchor: Option<DateTime<Utc>>,
    /// Operator keep-alive expiry.
    pub keepalive_until: Option<DateTime<Utc>>,
}

/// Instance-level classification: provider termination, empty windows and
/// operator keep-alives layered on top of [`classify`].
pub fn classify_instance(
    now: DateTime<Utc>,
    instance: &Instance,
    samples: &[HeartbeatSample],
    ctx: &LivenessContext,
    policy: &Policy,
) -> LivenessState {
    if ctx.provider_terminated {
        return LivenessState::Lost;
    }

    let anchor = ctx.anchor.unwrap_or(instance.created_at).max(instance.created_at);
    let relevant: Vec<HeartbeatSample> = samples
        .iter()
        .filter(|s| s.timestamp >= anchor)
        .cloned()
        .collect();
    let last_seen = relevant.last().map(|s| s.timestamp).unwrap_or(anchor);

    let state = classify_from(now, last_seen, &relevant, policy);
    apply_keepalive(state, ctx.keepalive_until, now)
}

/// A live keep-alive suppresses orphan/lost escalation.
pub fn apply_keepalive(
    state: LivenessState,
    keepalive_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> LivenessState {
    match (state, keepalive_until) {
        (LivenessState::Orphaned | LivenessState::Lost, Some(until)) if until > now => {
            LivenessState::Healthy
        }
        _ => state,
    }
}
