//! Side effects for decision-engine actions and operator requests.
//!
//! Every function re-checks the lifecycle status before touching the
//! provider, so a repeated call on an instance that already moved on is a
//! no-op returning `Ok(false)`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fleetwarden_common::bus::Severity;
use fleetwarden_common::{Action, FleetError, Instance, InstanceStatus};
use fleetwarden_providers::CloudProvider;
use serde_json::json;
use uuid::Uuid;

use crate::fleet::Fleet;
use crate::logger::elapsed_ms;
use crate::retry::call_with_retry;
use crate::state_machine;

async fn provider_call<F, Fut>(fleet: &Fleet, instance: &Instance, op: &str, f: F) -> Result<bool, FleetError>
where
    F: Fn(Arc<dyn CloudProvider>, String) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let provider = fleet.providers.get(&instance.provider)?;
    let pid = instance.provider_instance_id.clone();
    call_with_retry(&fleet.settings.provider_calls, op, || f(provider.clone(), pid.clone())).await
}

async fn complete(fleet: &Fleet, log_id: Option<Uuid>, start: Instant, res: &Result<bool, FleetError>) {
    let Some(log_id) = log_id else {
        return;
    };
    let (status, err) = match res {
        Ok(_) => ("success", None),
        Err(e) => ("failed", Some(e.to_string())),
    };
    fleet
        .logger
        .log_event_complete(log_id, status, elapsed_ms(start), err.as_deref())
        .await
        .ok();
}

/// Carry out a decision for an instance whose action lock the caller holds.
pub async fn execute(fleet: &Fleet, instance: &Instance, action: &Action, reason: &str) -> Result<bool, FleetError> {
    match action {
        Action::None => Ok(false),
        Action::Warn { message } => {
            let first = fleet
                .roster
                .tracking(instance.id)
                .await
                .map(|t| t.last_warning.as_deref() != Some(message.as_str()))
                .unwrap_or(true);
            if first {
                tracing::warn!(instance_id = %instance.id, "⚠️ [actions] {}", message);
                fleet
                    .notifier
                    .notify(Severity::Warning, &format!("instance {}: {}", instance.id, message))
                    .await;
                fleet
                    .roster
                    .update_tracking(instance.id, |t| t.last_warning = Some(message.clone()))
                    .await;
            }
            Ok(false)
        }
        Action::Pause => pause(fleet, instance, reason).await,
        Action::Hibernate => hibernate(fleet, instance, reason).await,
        Action::Delete { snapshot_first } => delete(fleet, instance, *snapshot_first, true, reason).await,
        Action::Failover => match fleet.failover.start(instance.id).await {
            Ok(_) => Ok(true),
            Err(FleetError::ConcurrentSession(_)) => Ok(false),
            Err(e) => Err(e),
        },
    }
}

pub async fn pause(fleet: &Fleet, instance: &Instance, reason: &str) -> Result<bool, FleetError> {
    if !matches!(instance.status, InstanceStatus::Running | InstanceStatus::Orphaned) {
        return Ok(false);
    }
    let start = Instant::now();
    let log_id = fleet
        .logger
        .log_event_with_metadata("PAUSE", "in_progress", instance.id, None, Some(json!({ "reason": reason })))
        .await
        .ok();

    let res = provider_call(fleet, instance, "pause", |p, pid| async move { p.pause(&pid).await }).await;
    complete(fleet, log_id, start, &res).await;
    res?;

    let changed = state_machine::mark_paused(&fleet.roster, &fleet.logger, instance.id, reason).await?;
    if changed {
        tracing::info!(instance_id = %instance.id, "⏸️ [actions] paused ({})", reason);
    }
    Ok(changed)
}

/// Pause plus a best-effort checkpoint when the provider supports one.
pub async fn hibernate(fleet: &Fleet, instance: &Instance, reason: &str) -> Result<bool, FleetError> {
    if !matches!(instance.status, InstanceStatus::Running | InstanceStatus::Orphaned) {
        return Ok(false);
    }
    let start = Instant::now();
    let log_id = fleet
        .logger
        .log_event_with_metadata("HIBERNATE", "in_progress", instance.id, None, Some(json!({ "reason": reason })))
        .await
        .ok();

    match fleet.sync.sync_now(instance.id).await {
        Ok(r) => tracing::info!(instance_id = %instance.id, "🔁 [actions] pre-hibernate sync: {} files", r.files_changed),
        Err(FleetError::NotFound(_)) => {}
        Err(e) => tracing::warn!(instance_id = %instance.id, "⚠️ [actions] pre-hibernate sync failed: {}", e),
    }

    let mut snapshot_ref = None;
    if instance.checkpoint_capable {
        if let Some(svc) = &fleet.snapshots {
            let pid = instance.provider_instance_id.clone();
            match tokio::time::timeout(fleet.settings.provider_calls.timeout, svc.create_snapshot(&pid)).await {
                Ok(Ok(r)) => snapshot_ref = Some(r),
                Ok(Err(e)) => tracing::warn!(instance_id = %instance.id, "⚠️ [actions] checkpoint failed, plain pause: {}", e),
                Err(_) => tracing::warn!(instance_id = %instance.id, "⚠️ [actions] checkpoint timed out, plain pause"),
            }
        }
    }
    if let Some(r) = &snapshot_ref {
        let r = r.clone();
        fleet.roster.update_tracking(instance.id, |t| t.snapshot_ref = Some(r)).await;
    }

    let res = provider_call(fleet, instance, "pause", |p, pid| async move { p.pause(&pid).await }).await;
    if let Some(log_id) = log_id {
        let (status, err) = match &res {
            Ok(_) => ("success", None),
            Err(e) => ("failed", Some(e.to_string())),
        };
        fleet
            .logger
            .log_event_complete_with_metadata(
                log_id,
                status,
                elapsed_ms(start),
                err.as_deref(),
                Some(json!({ "reason": reason, "snapshot_ref": snapshot_ref })),
            )
            .await
            .ok();
    }
    res?;

    let changed = state_machine::mark_hibernated(&fleet.roster, &fleet.logger, instance.id, reason).await?;
    if changed {
        tracing::info!(
            instance_id = %instance.id,
            checkpoint = snapshot_ref.is_some(),
            "💤 [actions] hibernated ({})",
            reason
        );
        if instance.status == InstanceStatus::Orphaned {
            fleet
                .notifier
                .notify(Severity::Warning, &format!("instance {} force-hibernated: {}", instance.id, reason))
                .await;
        }
    }
    Ok(changed)
}

pub async fn resume(fleet: &Fleet, instance: &Instance, reason: &str) -> Result<bool, FleetError> {
    if !instance.status.is_suspended() {
        return Ok(false);
    }
    let start = Instant::now();
    let log_id = fleet
        .logger
        .log_event_with_metadata("RESUME", "in_progress", instance.id, None, Some(json!({ "reason": reason })))
        .await
        .ok();
    let res = provider_call(fleet, instance, "resume", |p, pid| async move { p.resume(&pid).await }).await;
    complete(fleet, log_id, start, &res).await;
    res?;

    let snapshot_ref = fleet.roster.tracking(instance.id).await.and_then(|t| t.snapshot_ref);
    if instance.status == InstanceStatus::Hibernated {
        if let (Some(r), Some(svc)) = (snapshot_ref, &fleet.snapshots) {
            if let Err(e) = svc.restore_snapshot(&r, &instance.provider_instance_id).await {
                tracing::warn!(instance_id = %instance.id, "⚠️ [actions] checkpoint restore failed, cold resume: {}", e);
            }
        }
    }

    let changed = state_machine::mark_running(&fleet.roster, &fleet.logger, instance.id, reason).await?;
    let now = Utc::now();
    fleet
        .roster
        .update_tracking(instance.id, |t| {
            t.resumed_at = Some(now);
            t.orphan_observations = 0;
            t.unhealthy_since = None;
            t.last_warning = None;
            t.snapshot_ref = None;
        })
        .await;
    tracing::info!(instance_id = %instance.id, "▶️ [actions] resumed ({})", reason);
    Ok(changed)
}

/// Destroy an instance. `cascade` also tears down its standby.
pub async fn delete(
    fleet: &Fleet,
    instance: &Instance,
    snapshot_first: bool,
    cascade: bool,
    reason: &str,
) -> Result<bool, FleetError> {
    if instance.status == InstanceStatus::Destroyed {
        return Ok(false);
    }
    let start = Instant::now();
    let terminated = fleet
        .roster
        .tracking(instance.id)
        .await
        .map(|t| t.provider_terminated)
        .unwrap_or(false);
    let log_id = fleet
        .logger
        .log_event_with_metadata(
            "DESTROY",
            "in_progress",
            instance.id,
            None,
            Some(json!({ "reason": reason, "snapshot_first": snapshot_first, "provider_terminated": terminated })),
        )
        .await
        .ok();

    if snapshot_first && !terminated {
        if let Some(svc) = &fleet.snapshots {
            let pid = instance.provider_instance_id.clone();
            match tokio::time::timeout(fleet.settings.provider_calls.timeout, svc.create_snapshot(&pid)).await {
                Ok(Ok(r)) => tracing::info!(instance_id = %instance.id, "📸 [actions] snapshot {} before destroy", r),
                Ok(Err(e)) => tracing::warn!(instance_id = %instance.id, "⚠️ [actions] snapshot before destroy failed: {}", e),
                Err(_) => tracing::warn!(instance_id = %instance.id, "⚠️ [actions] snapshot before destroy timed out"),
            }
        }
    }

    fleet.sync.cancel(instance.id);

    let res = if terminated {
        Ok(true)
    } else {
        provider_call(fleet, instance, "destroy", |p, pid| async move { p.destroy(&pid).await }).await
    };
    complete(fleet, log_id, start, &res).await;
    res?;

    let changed = state_machine::mark_destroyed(&fleet.roster, &fleet.logger, instance.id, reason).await?;
    if cascade {
        if let Err(e) = fleet.standby.teardown_for(instance.id, "primary destroyed").await {
            tracing::warn!(instance_id = %instance.id, "⚠️ [actions] standby teardown failed: {}", e);
        }
    }
    fleet.samples.forget(instance.id).await;
    fleet.sync.forget(instance.id).await;
    if changed {
        tracing::info!(instance_id = %instance.id, "🗑️ [actions] destroyed ({})", reason);
        fleet
            .notifier
            .notify(Severity::Info, &format!("instance {} destroyed: {}", instance.id, reason))
            .await;
    }
    Ok(changed)
}

/// Operator-requested action kinds exposed on the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    Pause,
    Resume,
    Delete { keep_standby: bool },
}

/// Validate and run an operator action under the instance's action lock.
/// Guards are checked before any side effect.
pub async fn run_operator_action(fleet: &Fleet, instance_id: Uuid, action: OperatorAction) -> Result<bool, FleetError> {
    let lock = fleet
        .roster
        .lock_for(instance_id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("instance {}", instance_id)))?;
    let _guard = lock.lock().await;

    let instance = fleet
        .roster
        .get(instance_id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("instance {}", instance_id)))?;
    if fleet.failover.has_active(instance_id) {
        return Err(FleetError::ConcurrentSession(instance_id));
    }
    if instance.status == InstanceStatus::Destroyed {
        return Err(FleetError::NotFound(format!("instance {} is destroyed", instance_id)));
    }

    let destructive = !matches!(action, OperatorAction::Resume);
    if destructive {
        let policy = fleet.policy.current();
        if policy.is_protected(&instance) {
            return Err(FleetError::PolicyViolation(format!("instance {} is protected", instance_id)));
        }
        if instance.age_hours(Utc::now()) < policy.min_instance_age_hours {
            return Err(FleetError::PolicyViolation(format!(
                "instance {} is younger than {}h",
                instance_id, policy.min_instance_age_hours
            )));
        }
    }

    match action {
        OperatorAction::Pause => pause(fleet, &instance, "operator request").await,
        OperatorAction::Resume => resume(fleet, &instance, "operator request").await,
        OperatorAction::Delete { keep_standby } => {
            delete(fleet, &instance, false, !keep_standby, "operator request").await
        }
    }
}
