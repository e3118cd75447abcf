use fleetwarden_common::{FleetError, InstanceStatus};
use uuid::Uuid;

use crate::logger::ActionLogger;
use crate::roster::Roster;

use InstanceStatus::*;

async fn transition(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    allowed: &[InstanceStatus],
    to: InstanceStatus,
    reason: &str,
) -> Result<bool, FleetError> {
    match roster.compare_and_set_status(instance_id, allowed, to).await? {
        Some(from) => {
            if from != to {
                logger
                    .log_state_transition(instance_id, from.as_str(), to.as_str(), reason)
                    .await;
            }
            Ok(true)
        }
        None => {
            tracing::debug!(
                %instance_id,
                "⚠️ [state_machine] {} rejected: current status not in {:?}",
                to.as_str(),
                allowed
            );
            Ok(false)
        }
    }
}

/// PROVISIONING/PAUSED/HIBERNATED/ORPHANED/LOST -> RUNNING (idempotent).
pub async fn mark_running(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, FleetError> {
    transition(
        roster,
        logger,
        instance_id,
        &[Provisioning, Running, Paused, Hibernated, Orphaned, Lost],
        Running,
        reason,
    )
    .await
}

/// RUNNING/ORPHANED -> PAUSED.
pub async fn mark_paused(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, FleetError> {
    transition(roster, logger, instance_id, &[Running, Orphaned], Paused, reason).await
}

/// RUNNING/ORPHANED -> HIBERNATED.
pub async fn mark_hibernated(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, FleetError> {
    transition(roster, logger, instance_id, &[Running, Orphaned], Hibernated, reason).await
}

/// RUNNING -> ORPHANED. Only observed liveness drives this, never an action.
pub async fn mark_orphaned(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, FleetError> {
    transition(roster, logger, instance_id, &[Running], Orphaned, reason).await
}

/// RUNNING/ORPHANED -> LOST. Suspended instances keep their status.
pub async fn mark_lost(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, FleetError> {
    transition(roster, logger, instance_id, &[Running, Orphaned], Lost, reason).await
}

/// Anything -> DESTROYED (archived). Idempotent.
pub async fn mark_destroyed(
    roster: &Roster,
    logger: &ActionLogger,
    instance_id: Uuid,
    reason: &str,
) -> Result<bool, FleetError> {
    transition(
        roster,
        logger,
        instance_id,
        &[Provisioning, Running, Paused, Hibernated, Orphaned, Lost],
        Destroyed,
        reason,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwarden_common::{GpuSpec, Instance};

    async fn setup() -> (Roster, ActionLogger, Uuid) {
        let roster = Roster::new();
        let id = roster
            .insert(Instance::new_gpu(
                "mock",
                "i-1",
                GpuSpec {
                    gpu_class: "A10".into(),
                    gpu_rank: 4,
                    gpu_count: 1,
                    vram_gb: 24,
                },
            ))
            .await;
        (roster, ActionLogger::default(), id)
    }

    #[tokio::test]
    async fn pause_resume_cycle() {
        let (r, l, id) = setup().await;
        assert!(mark_paused(&r, &l, id, "idle").await.unwrap());
        assert!(!mark_paused(&r, &l, id, "idle").await.unwrap());
        assert!(!mark_lost(&r, &l, id, "silence").await.unwrap());
        assert!(mark_running(&r, &l, id, "resume").await.unwrap());
        assert_eq!(r.get(id).await.unwrap().status, Running);
    }

    #[tokio::test]
    async fn destroyed_is_terminal() {
        let (r, l, id) = setup().await;
        assert!(mark_destroyed(&r, &l, id, "delete").await.unwrap());
        assert!(!mark_running(&r, &l, id, "late heartbeat").await.unwrap());
        assert!(!mark_destroyed(&r, &l, id, "delete").await.unwrap());
    }
}
