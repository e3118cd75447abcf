//! Decision engine: (instance, liveness, policy, context) -> action.
//!
//! Pure and deterministic. Guards are checked before any classification
//! based rule so that protection and session exclusivity can never be
//! overridden by a liveness state.

use chrono::{DateTime, Utc};
use fleetwarden_common::{Action, Instance, InstanceStatus, LivenessState, Policy};

/// Per-instance facts gathered by the caller before evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    /// A standby exists for this primary and is `ready`.
    pub standby_ready: bool,
    /// The standby has failed too many syncs in a row.
    pub standby_degraded: bool,
    /// A failover session is already running for this primary.
    pub active_session: bool,
    /// Consecutive ticks this instance was classified orphaned (including this one).
    pub orphan_observations: u32,
    /// When the instance was first seen orphaned/lost in the current streak.
    pub unhealthy_since: Option<DateTime<Utc>>,
    /// Provider can checkpoint GPU memory before pausing.
    pub checkpoint_capable: bool,
    /// Provider can take a disk snapshot before destroy.
    pub snapshot_supported: bool,
}

pub fn evaluate(
    instance: &Instance,
    state: LivenessState,
    policy: Option<&Policy>,
    ctx: &EvaluationContext,
    now: DateTime<Utc>,
) -> Action {
    // No policy, no action.
    let Some(policy) = policy else {
        return Action::None;
    };
    if ctx.active_session {
        return Action::None;
    }
    if policy.is_protected(instance) {
        return Action::None;
    }
    if instance.age_hours(now) < policy.min_instance_age_hours {
        return Action::None;
    }
    if matches!(
        instance.status,
        InstanceStatus::Destroyed | InstanceStatus::Provisioning
    ) {
        return Action::None;
    }

    match state {
        LivenessState::Healthy => Action::None,
        LivenessState::Idle => {
            if instance.status.is_suspended() {
                Action::None
            } else if ctx.checkpoint_capable {
                Action::Hibernate
            } else {
                Action::Pause
            }
        }
        LivenessState::Orphaned => {
            if instance.status.is_suspended() {
                return Action::None;
            }
            if ctx.orphan_observations <= 1 {
                Action::Warn {
                    message: format!(
                        "instance {} missed heartbeats for more than {} minutes",
                        instance.id, policy.orphan_grace_minutes
                    ),
                }
            } else {
                Action::Hibernate
            }
        }
        LivenessState::Lost => {
            // Suspended instances are silent on purpose; they never fail over.
            if !instance.status.is_suspended() && ctx.standby_ready && !ctx.standby_degraded {
                return Action::Failover;
            }
            let since = ctx.unhealthy_since.unwrap_or(now);
            if now - since >= policy.delete_after() {
                Action::Delete {
                    snapshot_first: ctx.snapshot_supported,
                }
            } else {
                Action::Warn {
                    message: format!("instance {} presumed lost, no usable standby", instance.id),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleetwarden_common::GpuSpec;

    fn gpu_instance(age_hours: i64) -> Instance {
        let mut i = Instance::new_gpu(
            "mock",
            "i-1",
            GpuSpec {
                gpu_class: "A100".into(),
                gpu_rank: 10,
                gpu_count: 1,
                vram_gb: 40,
            },
        );
        i.created_at = Utc::now() - Duration::hours(age_hours);
        i
    }

    fn eval(i: &Instance, s: LivenessState, ctx: &EvaluationContext) -> Action {
        evaluate(i, s, Some(&Policy::default()), ctx, Utc::now())
    }

    #[test]
    fn no_policy_means_no_action() {
        let i = gpu_instance(5);
        let ctx = EvaluationContext {
            standby_ready: true,
            ..Default::default()
        };
        assert_eq!(evaluate(&i, LivenessState::Lost, None, &ctx, Utc::now()), Action::None);
    }

    #[test]
    fn protected_instances_are_never_touched() {
        let mut i = gpu_instance(5);
        i.protected = true;
        let ctx = EvaluationContext {
            standby_ready: true,
            unhealthy_since: Some(Utc::now() - Duration::hours(10)),
            ..Default::default()
        };
        for s in [
            LivenessState::Healthy,
            LivenessState::Idle,
            LivenessState::Orphaned,
            LivenessState::Lost,
        ] {
            assert_eq!(eval(&i, s, &ctx), Action::None);
        }

        let i = gpu_instance(5);
        let mut p = Policy::default();
        p.protected_instance_ids.insert(i.id);
        assert_eq!(
            evaluate(&i, LivenessState::Idle, Some(&p), &ctx, Utc::now()),
            Action::None
        );
    }

    #[test]
    fn young_instances_get_a_grace_period() {
        let mut i = gpu_instance(0);
        i.created_at = Utc::now() - Duration::minutes(5);
        assert_eq!(eval(&i, LivenessState::Idle, &Default::default()), Action::None);
    }

    #[test]
    fn idle_pauses_or_hibernates_by_capability() {
        let i = gpu_instance(3);
        assert_eq!(eval(&i, LivenessState::Idle, &Default::default()), Action::Pause);
        let ctx = EvaluationContext {
            checkpoint_capable: true,
            ..Default::default()
        };
        assert_eq!(eval(&i, LivenessState::Idle, &ctx), Action::Hibernate);

        let mut paused = gpu_instance(3);
        paused.status = InstanceStatus::Paused;
        assert_eq!(eval(&paused, LivenessState::Idle, &ctx), Action::None);
    }

    #[test]
    fn orphaned_warns_then_hibernates() {
        let i = gpu_instance(3);
        let first = EvaluationContext {
            orphan_observations: 1,
            ..Default::default()
        };
        assert!(matches!(eval(&i, LivenessState::Orphaned, &first), Action::Warn { .. }));
        let second = EvaluationContext {
            orphan_observations: 2,
            ..Default::default()
        };
        assert_eq!(eval(&i, LivenessState::Orphaned, &second), Action::Hibernate);
    }

    #[test]
    fn lost_with_ready_standby_fails_over() {
        let i = gpu_instance(3);
        let ctx = EvaluationContext {
            standby_ready: true,
            ..Default::default()
        };
        assert_eq!(eval(&i, LivenessState::Lost, &ctx), Action::Failover);
    }

    #[test]
    fn active_session_blocks_everything() {
        let i = gpu_instance(3);
        let ctx = EvaluationContext {
            standby_ready: true,
            active_session: true,
            ..Default::default()
        };
        assert_eq!(eval(&i, LivenessState::Lost, &ctx), Action::None);
    }

    #[test]
    fn lost_without_standby_waits_then_deletes() {
        let i = gpu_instance(10);
        let recent = EvaluationContext {
            unhealthy_since: Some(Utc::now() - Duration::minutes(30)),
            snapshot_supported: true,
            ..Default::default()
        };
        assert!(matches!(eval(&i, LivenessState::Lost, &recent), Action::Warn { .. }));

        let old = EvaluationContext {
            unhealthy_since: Some(Utc::now() - Duration::hours(3)),
            snapshot_supported: true,
            ..Default::default()
        };
        assert_eq!(
            eval(&i, LivenessState::Lost, &old),
            Action::Delete { snapshot_first: true }
        );
    }

    #[test]
    fn never_delete_threshold_keeps_warning() {
        let i = gpu_instance(10);
        let ctx = EvaluationContext {
            unhealthy_since: Some(Utc::now() - Duration::days(365)),
            ..Default::default()
        };
        for hours in [1e13, f64::MAX, f64::INFINITY, f64::NAN] {
            let p = Policy {
                delete_after_idle_hours: hours,
                ..Policy::default()
            };
            assert!(matches!(
                evaluate(&i, LivenessState::Lost, Some(&p), &ctx, Utc::now()),
                Action::Warn { .. }
            ));
        }
    }

    #[test]
    fn degraded_standby_does_not_trigger_failover() {
        let i = gpu_instance(10);
        let ctx = EvaluationContext {
            standby_ready: true,
            standby_degraded: true,
            unhealthy_since: Some(Utc::now() - Duration::hours(3)),
            ..Default::default()
        };
        assert_eq!(
            eval(&i, LivenessState::Lost, &ctx),
            Action::Delete { snapshot_first: false }
        );
    }

    #[test]
    fn silent_paused_instance_is_deleted_not_failed_over() {
        let mut i = gpu_instance(10);
        i.status = InstanceStatus::Paused;
        let ctx = EvaluationContext {
            standby_ready: true,
            unhealthy_since: Some(Utc::now() - Duration::hours(3)),
            ..Default::default()
        };
        assert_eq!(
            eval(&i, LivenessState::Lost, &ctx),
            Action::Delete { snapshot_first: false }
        );
    }
}
