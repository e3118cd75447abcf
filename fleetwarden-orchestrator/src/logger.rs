use sqlx::{Pool, Postgres};
use uuid::Uuid;

/// Action logger. Every event goes to tracing; when a pool is configured it
/// is also persisted to `action_logs` (queries built at runtime, no DATABASE_URL at build time).
#[derive(Clone, Default)]
pub struct ActionLogger {
    db: Option<Pool<Postgres>>,
}

impl ActionLogger {
    pub fn new(db: Option<Pool<Postgres>>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> Option<&Pool<Postgres>> {
        self.db.as_ref()
    }

    pub async fn log_event(
        &self,
        action_type: &str,
        status: &str,
        instance_id: Uuid,
        error_message: Option<&str>,
    ) -> Result<Uuid, sqlx::Error> {
        self.log_event_with_metadata(action_type, status, instance_id, error_message, None)
            .await
    }

    /// Log event with metadata (context info)
    pub async fn log_event_with_metadata(
        &self,
        action_type: &str,
        status: &str,
        instance_id: Uuid,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Uuid, sqlx::Error> {
        let log_id = Uuid::new_v4();
        tracing::info!(
            action_type,
            status,
            %instance_id,
            %log_id,
            error = error_message.unwrap_or(""),
            "📝 [action-log] {} - {}",
            action_type,
            status
        );

        if let Some(db) = &self.db {
            sqlx::query(
                "INSERT INTO action_logs
                 (id, action_type, component, status, error_message, instance_id, metadata, created_at)
                 VALUES ($1, $2, 'orchestrator', $3, $4, $5, $6, NOW())",
            )
            .bind(log_id)
            .bind(action_type)
            .bind(status)
            .bind(error_message)
            .bind(instance_id)
            .bind(metadata)
            .execute(db)
            .await?;
        }
        Ok(log_id)
    }

    /// Log event completion with duration
    pub async fn log_event_complete(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        self.log_event_complete_with_metadata(log_id, status, duration_ms, error_message, None)
            .await
    }

    pub async fn log_event_complete_with_metadata(
        &self,
        log_id: Uuid,
        status: &str,
        duration_ms: i32,
        error_message: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), sqlx::Error> {
        if status == "failed" {
            tracing::warn!(%log_id, duration_ms, error = error_message.unwrap_or(""), "📝 [action-log] completed: failed");
        } else {
            tracing::debug!(%log_id, duration_ms, "📝 [action-log] completed: {}", status);
        }

        if let Some(db) = &self.db {
            sqlx::query(
                "UPDATE action_logs
                 SET status = $2, duration_ms = $3, error_message = $4, metadata = COALESCE($5, metadata), completed_at = NOW()
                 WHERE id = $1",
            )
            .bind(log_id)
            .bind(status)
            .bind(duration_ms)
            .bind(error_message)
            .bind(metadata)
            .execute(db)
            .await?;
        }
        Ok(())
    }

    /// Record a lifecycle transition in instance_state_history.
    pub async fn log_state_transition(
        &self,
        instance_id: Uuid,
        from_status: &str,
        to_status: &str,
        reason: &str,
    ) {
        tracing::info!(%instance_id, "🔄 [state] {} -> {} ({})", from_status, to_status, reason);
        if let Some(db) = &self.db {
            let res = sqlx::query(
                "INSERT INTO instance_state_history (instance_id, from_status, to_status, reason)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(instance_id)
            .bind(from_status)
            .bind(to_status)
            .bind(reason)
            .execute(db)
            .await;
            if let Err(e) = res {
                tracing::warn!(%instance_id, "⚠️ [state] failed to persist transition: {}", e);
            }
        }
    }
}

pub fn elapsed_ms(start: std::time::Instant) -> i32 {
    start.elapsed().as_millis().min(i32::MAX as u128) as i32
}
