use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

/// Connect to Postgres and apply migrations (source of truth is /sqlx-migrations at workspace root).
pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<Pool<Postgres>> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Postgres connectivity check failed")?;
    tracing::info!("✅ Connected to Database");

    sqlx::migrate!("../sqlx-migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("📦 Migrations applied");
    Ok(pool)
}
