use std::sync::Arc;
use std::time::Duration;

use fleetwarden_common::FleetError;
use tokio_util::sync::CancellationToken;

use crate::fleet::Fleet;

/// job-sync: passive replication for every primary whose cadence or backoff has elapsed.
pub async fn run(fleet: Arc<Fleet>, shutdown: CancellationToken) {
    let tick = fleet.settings.sync.interval.min(Duration::from_secs(5)).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tracing::info!(
        "🔁 job-sync started (cadence {}s)",
        fleet.settings.sync.interval.as_secs()
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("🔁 job-sync stopping");
                return;
            }
            _ = interval.tick() => {}
        }

        for primary_id in fleet.sync.due().await {
            let fleet = fleet.clone();
            tokio::spawn(async move {
                match fleet.sync.sync_now(primary_id).await {
                    Ok(r) => tracing::debug!(
                        %primary_id,
                        files = r.files_changed,
                        bytes = r.bytes_transferred,
                        "🔁 [job-sync] pass done in {}ms",
                        r.duration_ms
                    ),
                    // already running or primary went away; next tick decides again
                    Err(FleetError::TransientProvider(_)) | Err(FleetError::NotFound(_)) => {}
                    Err(e) => tracing::warn!(%primary_id, "⚠️ [job-sync] pass failed: {}", e),
                }
            });
        }
    }
}
