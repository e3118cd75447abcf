mod common;

use std::time::Duration;

use chrono::Utc;
use common::{eventually, fast_settings, offer, Harness, GPU_PROVIDER};
use fleetwarden_common::bus::Severity;
use fleetwarden_common::{FailoverPhase, FleetError, InstanceStatus, Policy, ReliabilityOutcome};
use fleetwarden_orchestrator::actions::{run_operator_action, OperatorAction};
use fleetwarden_orchestrator::poll_job::poll_once;
use fleetwarden_providers::mock::MockFailure;

#[tokio::test]
async fn transient_provisioning_failure_moves_to_next_candidate() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu
        .set_offers(vec![
            offer("cheap", "m-cheap", 2, 16, 0.5),
            offer("pricey", "m-pricey", 2, 16, 0.9),
        ])
        .await;
    // exhausts the per-candidate retry budget
    for _ in 0..3 {
        h.gpu.push_provision_failure(MockFailure::Transient).await;
    }

    let session = h.fleet.failover.run_to_completion(primary.id).await.unwrap();
    assert_eq!(session.phase, FailoverPhase::Complete, "{:?}", session.failure_reason);
    assert_eq!(session.replacement.unwrap().machine_id, "m-pricey");

    let cheap = h.fleet.ledger.records(GPU_PROVIDER, "m-cheap").await;
    assert_eq!(cheap.len(), 1);
    assert_eq!(cheap[0].outcome, ReliabilityOutcome::ProvisioningFailure);
    let pricey = h.fleet.ledger.records(GPU_PROVIDER, "m-pricey").await;
    assert_eq!(pricey[0].outcome, ReliabilityOutcome::Success);

    // nothing to restore from: proceeds empty and says so
    assert!(session.possible_data_loss);
    assert!(h
        .notifications(Severity::Warning)
        .iter()
        .any(|m| m.contains("no restore point")));
}

#[tokio::test]
async fn late_provision_answer_does_not_leak_a_machine() {
    let mut settings = fast_settings();
    settings.failover.provision_timeout = Duration::from_millis(200);
    let h = Harness::with(settings, Policy::default());
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu
        .set_offers(vec![
            offer("a", "m-a", 2, 16, 0.5),
            offer("b", "m-b", 2, 16, 0.6),
        ])
        .await;
    // the vendor creates mock-1 but answers after the session gave up on it
    h.gpu
        .push_provision_failure(MockFailure::Slow(Duration::from_millis(400)))
        .await;

    let session = h.fleet.failover.run_to_completion(primary.id).await.unwrap();
    assert_eq!(session.phase, FailoverPhase::Complete, "{:?}", session.failure_reason);
    assert_eq!(session.replacement.unwrap().machine_id, "m-b");

    assert!(h.find(GPU_PROVIDER, "mock-1").await.is_none());
    assert_eq!(h.gpu.status_of("mock-1").await.as_deref(), Some("terminated"));
    assert!(h.gpu.calls().await.contains(&"destroy:mock-1".to_string()));
    assert_eq!(h.gpu.status_of("mock-2").await.as_deref(), Some("running"));

    let slow = h.fleet.ledger.records(GPU_PROVIDER, "m-a").await;
    assert_eq!(slow[0].outcome, ReliabilityOutcome::Timeout);
}

#[tokio::test]
async fn blacklisted_machine_is_skipped() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu
        .set_offers(vec![
            offer("cheap", "m-flaky", 2, 16, 0.5),
            offer("pricey", "m-solid", 2, 16, 0.9),
        ])
        .await;
    for _ in 0..2 {
        h.fleet
            .ledger
            .record(GPU_PROVIDER, "m-flaky", ReliabilityOutcome::PrematureTermination)
            .await;
    }
    assert!(h.fleet.ledger.is_blacklisted(GPU_PROVIDER, "m-flaky").await);

    let session = h.fleet.failover.run_to_completion(primary.id).await.unwrap();
    assert_eq!(session.phase, FailoverPhase::Complete);
    assert_eq!(session.replacement.unwrap().machine_id, "m-solid");
    assert!(!h.gpu.calls().await.contains(&"provision:cheap".to_string()));
}

#[tokio::test]
async fn weaker_offers_are_never_candidates() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu
        .set_offers(vec![
            offer("too-small", "m-small", 2, 8, 0.1),
            offer("too-old", "m-old", 1, 16, 0.1),
            offer("same-host", "m-1", 2, 16, 0.1),
        ])
        .await;

    let session = h.fleet.failover.run_to_completion(primary.id).await.unwrap();
    assert_eq!(session.phase, FailoverPhase::Failed);
    assert!(session
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("no replacement offer"));
    assert_eq!(
        session.phase_sequence().last(),
        Some(&FailoverPhase::Failed)
    );
    assert!(session.phase_sequence().contains(&FailoverPhase::Searching));
    assert!(!h.gpu.calls().await.iter().any(|c| c.starts_with("provision:")));
    assert!(h
        .notifications(Severity::Critical)
        .iter()
        .any(|m| m.contains("operator attention required")));
}

#[tokio::test]
async fn permanent_provisioning_error_aborts_the_session() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu
        .set_offers(vec![
            offer("a", "m-a", 2, 16, 0.5),
            offer("b", "m-b", 2, 16, 0.6),
        ])
        .await;
    h.gpu.push_provision_failure(MockFailure::Permanent).await;

    let session = h.fleet.failover.run_to_completion(primary.id).await.unwrap();
    assert_eq!(session.phase, FailoverPhase::Failed);
    assert!(session.failure_reason.as_deref().unwrap().contains("quota"));
    let provisions = h
        .gpu
        .calls()
        .await
        .into_iter()
        .filter(|c| c.starts_with("provision:"))
        .count();
    assert_eq!(provisions, 1);
    assert!(h.find(GPU_PROVIDER, "mock-1").await.is_none());
    assert_eq!(h.instance(primary.id).await.status, InstanceStatus::Lost);
}

#[tokio::test]
async fn cancelling_during_restore_tears_down_the_replacement() {
    let mut settings = fast_settings();
    settings.failover.restore_timeout = Duration::from_secs(30);
    let h = Harness::with(settings, Policy::default());
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu.set_offers(vec![offer("a", "m-a", 2, 16, 0.5)]).await;
    h.fleet.request_standby(primary.id).await.unwrap();
    h.transport.set_delay(Duration::from_secs(30));

    let session_id = h.fleet.failover.start(primary.id).await.unwrap();
    let fleet = h.fleet.clone();
    let restoring = eventually(move || {
        let fleet = fleet.clone();
        async move {
            fleet
                .failover
                .session(session_id)
                .map(|s| s.phase == FailoverPhase::Restoring)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(restoring);

    let cancelled = h.fleet.failover.cancel(primary.id, "operator abort").unwrap();
    assert_eq!(cancelled, session_id);
    let session = h.finished(session_id).await;
    assert_eq!(session.phase, FailoverPhase::Failed);
    assert!(session.failure_reason.as_deref().unwrap().contains("operator abort"));

    let replacement = h.find(GPU_PROVIDER, "mock-1").await.unwrap();
    assert_eq!(replacement.status, InstanceStatus::Destroyed);
    assert_eq!(h.gpu.status_of("mock-1").await.as_deref(), Some("terminated"));
    assert!(!h.fleet.failover.has_active(primary.id));
    assert!(matches!(
        h.fleet.failover.cancel(primary.id, "again"),
        Err(FleetError::NotFound(_))
    ));
}

#[tokio::test]
async fn second_session_for_same_primary_is_rejected() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu
        .set_offers(vec![
            offer("a", "m-a", 2, 16, 0.5),
            offer("b", "m-b", 2, 16, 0.6),
        ])
        .await;
    // every attempt against the first candidate hangs past the call timeout
    for _ in 0..3 {
        h.gpu.push_provision_failure(MockFailure::Hang).await;
    }

    let session_id = h.fleet.failover.start(primary.id).await.unwrap();
    assert_eq!(
        h.fleet.failover.start(primary.id).await,
        Err(FleetError::ConcurrentSession(primary.id))
    );

    let fleet = h.fleet.clone();
    let provisioning = eventually(move || {
        let fleet = fleet.clone();
        async move {
            fleet
                .failover
                .session(session_id)
                .map(|s| s.phase == FailoverPhase::Provisioning)
                .unwrap_or(false)
        }
    })
    .await;
    assert!(provisioning);
    assert_eq!(
        run_operator_action(&h.fleet, primary.id, OperatorAction::Pause).await,
        Err(FleetError::ConcurrentSession(primary.id))
    );

    // the in-flight provision call returns before the cancel is honoured
    h.fleet.failover.cancel(session_id, "test over").unwrap();
    let session = h.finished(session_id).await;
    assert_eq!(session.phase, FailoverPhase::Failed);
    assert!(session.failure_reason.as_deref().unwrap().contains("test over"));
    assert_eq!(h.fleet.failover.sessions().len(), 1);
    assert!(!h.gpu.calls().await.contains(&"provision:b".to_string()));
    let hung = h.fleet.ledger.records(GPU_PROVIDER, "m-a").await;
    assert_eq!(hung.len(), 1);
    assert_eq!(hung[0].outcome, ReliabilityOutcome::ProvisioningFailure);
}

#[tokio::test]
async fn degraded_standby_flags_possible_data_loss() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu.set_offers(vec![offer("a", "m-a", 2, 16, 0.5)]).await;
    h.fleet.request_standby(primary.id).await.unwrap();

    h.transport.set_always_fail(true);
    for _ in 0..2 {
        assert!(h.fleet.sync.sync_now(primary.id).await.is_err());
    }
    assert!(h.fleet.standby.is_degraded(primary.id).await);
    h.transport.set_always_fail(false);

    let session = h.fleet.failover.run_to_completion(primary.id).await.unwrap();
    assert_eq!(session.phase, FailoverPhase::Complete);
    assert!(session.possible_data_loss);
    assert!(h
        .notifications(Severity::Warning)
        .iter()
        .any(|m| m.contains("possible data loss")));
}

#[tokio::test]
async fn synthetic_loss_does_not_penalise_the_host() {
    let h = Harness::new();
    let primary = h.primary("gpu-1", "m-1").await;
    h.gpu.set_offers(vec![offer("a", "m-a", 2, 16, 0.5)]).await;

    let session_id = h.fleet.failover.simulate_gpu_lost(primary.id).await.unwrap();
    let session = h.finished(session_id).await;
    assert!(session.synthetic);
    assert_eq!(session.phase, FailoverPhase::Complete);
    assert!(h.fleet.ledger.records(GPU_PROVIDER, "m-1").await.is_empty());
}

#[tokio::test]
async fn reclaimed_primary_is_not_destroyed_twice() {
    let h = Harness::new();
    let primary = h.primary("gpu-gone", "m-gone").await;
    h.gpu.set_offers(vec![offer("a", "m-a", 2, 16, 0.5)]).await;
    h.feed(primary.id, &[50.0], Utc::now()).await;
    h.fleet.request_standby(primary.id).await.unwrap();

    h.gpu.reclaim("gpu-gone").await;
    let summary = poll_once(&h.fleet, Utc::now()).await;
    assert_eq!(summary.terminated, 1);
    assert_eq!(summary.actions, 1);

    let sessions = h.fleet.failover.sessions();
    let session = h.finished(sessions[0].id).await;
    assert_eq!(session.phase, FailoverPhase::Complete);
    assert!(!h.gpu.calls().await.contains(&"destroy:gpu-gone".to_string()));
    assert_eq!(h.instance(primary.id).await.status, InstanceStatus::Destroyed);
    // recorded once by reconciliation, not again by the session
    let records = h.fleet.ledger.records(GPU_PROVIDER, "m-gone").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, ReliabilityOutcome::PrematureTermination);
}

#[tokio::test]
async fn failover_storm_raises_a_critical_alert() {
    let mut settings = fast_settings();
    settings.failover.alert_failovers_per_hour = 1;
    let h = Harness::with(settings, Policy::default());
    let a = h.primary("gpu-a", "m-a").await;
    let b = h.primary("gpu-b", "m-b").await;

    h.fleet.failover.run_to_completion(a.id).await.unwrap();
    assert!(!h
        .notifications(Severity::Critical)
        .iter()
        .any(|m| m.contains("failovers in 1 hour")));
    h.fleet.failover.run_to_completion(b.id).await.unwrap();
    assert!(h
        .notifications(Severity::Critical)
        .iter()
        .any(|m| m.contains("2 failovers in 1 hour")));
}
