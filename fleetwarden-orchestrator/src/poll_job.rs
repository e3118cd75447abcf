use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetwarden_common::bus::Severity;
use fleetwarden_common::{Action, Instance, InstanceKind, InstanceStatus, LivenessState, Policy, ReliabilityOutcome};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::actions;
use crate::decision;
use crate::fleet::Fleet;
use crate::retry::call_with_retry;
use crate::sampler::{self, SampleOutcome};
use crate::state_machine;

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct PollSummary {
    pub evaluated: usize,
    pub skipped: usize,
    pub sampled: usize,
    pub missed: usize,
    pub actions: usize,
    pub failed_actions: usize,
    pub terminated: usize,
}

#[derive(Debug, Default)]
struct TickOutcome {
    evaluated: bool,
    sample: Option<SampleOutcome>,
    acted: bool,
    failed: bool,
}

/// job-poll: liveness -> decision -> action for every primary, once per interval.
pub async fn run(fleet: Arc<Fleet>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(fleet.settings.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(
        "🛰️ job-poll started (every {}s, concurrency {})",
        fleet.settings.poll_interval.as_secs(),
        fleet.settings.poll_concurrency
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("🛰️ job-poll stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        let summary = poll_once(&fleet, Utc::now()).await;
        if summary.actions > 0 || summary.failed_actions > 0 || summary.terminated > 0 {
            tracing::info!(
                evaluated = summary.evaluated,
                actions = summary.actions,
                failed = summary.failed_actions,
                terminated = summary.terminated,
                "🛰️ [job-poll] tick done"
            );
        } else {
            tracing::debug!(evaluated = summary.evaluated, "🛰️ [job-poll] tick done");
        }
    }
}

/// One full pass over the roster. Each instance is an independent unit of work.
pub async fn poll_once(fleet: &Arc<Fleet>, now: DateTime<Utc>) -> PollSummary {
    let mut summary = PollSummary {
        terminated: reconcile(fleet, now).await,
        ..Default::default()
    };

    let policy = fleet.policy.current();
    let primaries = fleet.roster.list_primaries().await;
    let outcomes: Vec<TickOutcome> = futures_util::stream::iter(primaries)
        .map(|instance| evaluate_one(fleet, instance, &policy, now))
        .buffer_unordered(fleet.settings.poll_concurrency.max(1))
        .collect()
        .await;

    for o in outcomes {
        if o.evaluated {
            summary.evaluated += 1;
        } else {
            summary.skipped += 1;
        }
        match o.sample {
            Some(SampleOutcome::Recorded) => summary.sampled += 1,
            Some(SampleOutcome::Missed) => summary.missed += 1,
            _ => {}
        }
        if o.acted {
            summary.actions += 1;
        }
        if o.failed {
            summary.failed_actions += 1;
        }
    }
    summary
}

/// Compare the roster against provider listings. Instances a provider no
/// longer lists are flagged terminated. A provider whose listing fails is
/// skipped for this tick and its instances keep their last known state.
async fn reconcile(fleet: &Arc<Fleet>, now: DateTime<Utc>) -> usize {
    let mut terminated = 0;
    let roster = fleet.roster.list().await;

    for provider in fleet.providers.all() {
        let listed = call_with_retry(&fleet.settings.provider_calls, "list_instances", || {
            let provider = provider.clone();
            async move { provider.list_instances().await }
        })
        .await;
        let listed: HashSet<String> = match listed {
            Ok(l) => l.into_iter().map(|d| d.provider_instance_id).collect(),
            Err(e) => {
                tracing::warn!("⚠️ [job-poll] listing {} failed, keeping last known state: {}", provider.name(), e);
                continue;
            }
        };

        for instance in roster.iter().filter(|i| i.provider.eq_ignore_ascii_case(provider.name())) {
            if matches!(instance.status, InstanceStatus::Destroyed | InstanceStatus::Provisioning)
                || listed.contains(&instance.provider_instance_id)
            {
                continue;
            }
            let already = fleet
                .roster
                .tracking(instance.id)
                .await
                .map(|t| t.provider_terminated)
                .unwrap_or(true);
            if already {
                continue;
            }
            fleet.roster.update_tracking(instance.id, |t| t.provider_terminated = true).await;
            terminated += 1;
            tracing::warn!(
                instance_id = %instance.id,
                "☠️ [job-poll] {}/{} no longer listed by provider",
                instance.provider,
                instance.provider_instance_id
            );

            match instance.kind {
                InstanceKind::Gpu => {
                    if let Some(machine) = &instance.machine_id {
                        fleet
                            .ledger
                            .record_at(&instance.provider, machine, ReliabilityOutcome::PrematureTermination, now)
                            .await;
                    }
                }
                InstanceKind::CpuStandby => standby_reclaimed(fleet, instance).await,
            }
        }
    }
    terminated
}

async fn standby_reclaimed(fleet: &Arc<Fleet>, standby: &Instance) {
    state_machine::mark_destroyed(&fleet.roster, &fleet.logger, standby.id, "reclaimed by provider")
        .await
        .ok();
    let Some(primary_id) = fleet.standby.primary_for_standby(standby.id).await else {
        return;
    };
    fleet.sync.cancel(primary_id);
    fleet.standby.retire(primary_id, "standby reclaimed by provider").await;
    fleet
        .notifier
        .notify(
            Severity::Warning,
            &format!("standby for {} was reclaimed by its provider", primary_id),
        )
        .await;

    let primary_alive = fleet
        .roster
        .get(primary_id)
        .await
        .map(|p| p.status != InstanceStatus::Destroyed)
        .unwrap_or(false);
    if fleet.settings.failover.continuous_protection && primary_alive {
        let fleet = fleet.clone();
        tokio::spawn(async move {
            if let Err(e) = fleet.request_standby(primary_id).await {
                tracing::warn!(%primary_id, "⚠️ [job-poll] standby re-provisioning failed: {}", e);
            }
        });
    }
}

async fn evaluate_one(fleet: &Fleet, instance: Instance, policy: &Policy, now: DateTime<Utc>) -> TickOutcome {
    let mut out = TickOutcome::default();
    if fleet.failover.has_active(instance.id) {
        return out;
    }
    let Some(lock) = fleet.roster.lock_for(instance.id).await else {
        return out;
    };
    // another action is in flight for this instance; pick it up next tick
    let Ok(_guard) = lock.try_lock() else {
        tracing::debug!(instance_id = %instance.id, "⏭️ [job-poll] instance busy, skipping");
        return out;
    };
    let Some((instance, tracking)) = fleet.roster.get_with_tracking(instance.id).await else {
        return out;
    };
    if matches!(instance.status, InstanceStatus::Destroyed | InstanceStatus::Provisioning) {
        return out;
    }
    out.evaluated = true;

    if !instance.has_agent && !instance.status.is_suspended() && !tracking.provider_terminated {
        if let Ok(provider) = fleet.providers.get(&instance.provider) {
            out.sample = Some(
                sampler::sample_instance(
                    provider.as_ref(),
                    &fleet.samples,
                    &instance,
                    fleet.settings.provider_calls.timeout,
                    now,
                )
                .await,
            );
        }
    }

    let state = fleet.classify(&instance, &tracking, policy, now).await;
    fleet
        .roster
        .update_tracking(instance.id, |t| {
            t.last_state = Some(state);
            match state {
                LivenessState::Healthy => {
                    t.orphan_observations = 0;
                    t.unhealthy_since = None;
                    t.last_warning = None;
                }
                LivenessState::Idle => {
                    t.orphan_observations = 0;
                    t.unhealthy_since.get_or_insert(now);
                }
                LivenessState::Orphaned => {
                    t.orphan_observations += 1;
                    t.unhealthy_since.get_or_insert(now);
                }
                LivenessState::Lost => {
                    t.unhealthy_since.get_or_insert(now);
                }
            }
        })
        .await;

    let reflected = match state {
        LivenessState::Orphaned => {
            state_machine::mark_orphaned(&fleet.roster, &fleet.logger, instance.id, "missed heartbeats").await
        }
        LivenessState::Lost => {
            state_machine::mark_lost(&fleet.roster, &fleet.logger, instance.id, "presumed lost").await
        }
        LivenessState::Healthy | LivenessState::Idle
            if matches!(instance.status, InstanceStatus::Orphaned | InstanceStatus::Lost) =>
        {
            state_machine::mark_running(&fleet.roster, &fleet.logger, instance.id, "heartbeat resumed").await
        }
        _ => Ok(false),
    };
    if let Err(e) = reflected {
        tracing::warn!(instance_id = %instance.id, "⚠️ [job-poll] status update failed: {}", e);
    }

    let Some((instance, tracking)) = fleet.roster.get_with_tracking(instance.id).await else {
        return out;
    };
    let ctx = fleet.evaluation_context(&instance, &tracking).await;
    let action = decision::evaluate(&instance, state, Some(policy), &ctx, now);
    let label = action.as_str().to_string();
    fleet
        .roster
        .update_tracking(instance.id, |t| t.last_action = Some(label))
        .await;
    if action == Action::None {
        return out;
    }

    let reason = format!("{} instance", state.as_str());
    match actions::execute(fleet, &instance, &action, &reason).await {
        Ok(acted) => out.acted = acted,
        Err(e) => {
            out.failed = true;
            tracing::error!(
                instance_id = %instance.id,
                "❌ [job-poll] {} failed: {}",
                action.as_str(),
                e
            );
        }
    }
    out
}
