//! Postgres-backed checks. Skipped unless TEST_DATABASE_URL points at a
//! scratch database.

use fleetwarden_common::ReliabilityOutcome;
use fleetwarden_orchestrator::config::ReliabilitySettings;
use fleetwarden_orchestrator::logger::ActionLogger;
use fleetwarden_orchestrator::migrations::connect_and_migrate;
use fleetwarden_orchestrator::reliability::ReliabilityLedger;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

async fn test_pool() -> Option<Pool<Postgres>> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    Some(connect_and_migrate(&url).await.expect("migrate test database"))
}

#[tokio::test]
async fn ledger_survives_a_restart() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let machine = format!("m-{}", Uuid::new_v4());

    let ledger = ReliabilityLedger::new(ReliabilitySettings::default(), Some(pool.clone()));
    ledger
        .record("mock", &machine, ReliabilityOutcome::ProvisioningFailure)
        .await;
    ledger
        .record("mock", &machine, ReliabilityOutcome::PrematureTermination)
        .await;
    assert!(ledger.is_blacklisted("mock", &machine).await);

    let reloaded = ReliabilityLedger::new(ReliabilitySettings::default(), Some(pool));
    assert!(reloaded.load_from_db().await.unwrap() >= 2);
    assert_eq!(reloaded.records("mock", &machine).await.len(), 2);
    assert!(reloaded.is_blacklisted("mock", &machine).await);
}

#[tokio::test]
async fn action_log_rows_are_completed_in_place() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let logger = ActionLogger::new(Some(pool.clone()));
    let instance_id = Uuid::new_v4();

    let log_id = logger
        .log_event("PAUSE", "in_progress", instance_id, None)
        .await
        .unwrap();
    logger
        .log_event_complete(log_id, "success", 42, None)
        .await
        .unwrap();
    logger
        .log_state_transition(instance_id, "running", "paused", "idle")
        .await;

    let (status, duration_ms): (String, Option<i32>) =
        sqlx::query_as("SELECT status, duration_ms FROM action_logs WHERE id = $1")
            .bind(log_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "success");
    assert_eq!(duration_ms, Some(42));

    let transitions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM instance_state_history WHERE instance_id = $1")
            .bind(instance_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(transitions, 1);
}
