use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use fleetwarden_orchestrator::config::{load_policy, PolicyHandle, Settings};
use fleetwarden_orchestrator::fleet::Fleet;
use fleetwarden_orchestrator::notifier::{FanoutSink, NotificationSink, RedisSink, TracingSink, WebhookSink};
use fleetwarden_orchestrator::provider_manager::ProviderRegistry;
use fleetwarden_orchestrator::transport::RsyncTransport;
use fleetwarden_orchestrator::{api, commands, migrations, poll_job, sync_job};
use fleetwarden_providers::SnapshotService;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn snapshot_service(registry: &ProviderRegistry) -> Option<Arc<dyn SnapshotService>> {
    #[cfg(feature = "provider-mock")]
    if registry.names().iter().any(|n| n.starts_with("mock")) {
        return Some(Arc::new(fleetwarden_providers::mock::MockSnapshotService::new()));
    }
    let _ = registry;
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    let policy = load_policy(settings.policy_file.as_deref()).context("Invalid policy")?;
    let policy = PolicyHandle::new(policy, settings.policy_file.clone());

    let db = match &settings.database_url {
        Some(url) => Some(migrations::connect_and_migrate(url).await?),
        None => {
            tracing::info!("💾 DATABASE_URL not set, action log is tracing-only");
            None
        }
    };
    let redis_client = match &settings.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str()).context("Invalid REDIS_URL")?),
        None => None,
    };

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink)];
    if let Some(client) = &redis_client {
        sinks.push(Arc::new(RedisSink::new(client.clone())));
    }
    if let Some(url) = &settings.notify_webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url)?));
    }
    let notifier: Arc<dyn NotificationSink> = Arc::new(FanoutSink::new(sinks));

    let registry = ProviderRegistry::from_settings(&settings);
    if registry.is_empty() {
        anyhow::bail!("no provider adapter available for PROVIDER={:?}", settings.provider_names);
    }
    tracing::info!("☁️ providers: {}", registry.names().join(", "));
    let snapshots = snapshot_service(&registry);
    let transport = Arc::new(RsyncTransport::new(&settings.sync));

    let port = settings.http_port;
    let fleet = Fleet::new(settings, policy, registry, snapshots, transport, notifier, db);
    match fleet.ledger.load_from_db().await {
        Ok(n) if n > 0 => tracing::info!("📚 reliability ledger: {} record(s) loaded", n),
        Ok(_) => {}
        Err(e) => tracing::warn!("⚠️ reliability ledger reload failed: {:#}", e),
    }
    fleet.adopt_discovered().await;

    let shutdown = CancellationToken::new();

    // job-poll (liveness -> decision -> action)
    tokio::spawn(poll_job::run(fleet.clone(), shutdown.clone()));

    // job-sync (standby / object store replication)
    tokio::spawn(sync_job::run(fleet.clone(), shutdown.clone()));

    // Redis command listener
    if let Some(client) = redis_client {
        let fleet_cmd = fleet.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = commands::listen(fleet_cmd, client, token).await {
                tracing::error!("❌ command listener stopped: {:#}", e);
            }
        });
    }

    let app = api::router(fleet);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("🚀 Orchestrator listening on {}", addr);

    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("🛑 shutdown requested");
            token.cancel();
        })
        .await
        .context("HTTP server error")?;
    Ok(())
}
