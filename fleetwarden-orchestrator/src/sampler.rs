use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetwarden_common::{HeartbeatSample, Instance, SampleSource};
use fleetwarden_providers::inventory::MetricsOutcome;
use fleetwarden_providers::CloudProvider;

use crate::sample_store::{AppendOutcome, SampleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Recorded,
    /// Timeout or connection failure. Last-seen is left untouched.
    Missed,
    Rejected(AppendOutcome),
}

/// Poll one agent-less instance and feed the shared sample store.
/// Never surfaces an error: anything short of a metrics reply is a missed sample.
pub async fn sample_instance(
    provider: &dyn CloudProvider,
    samples: &SampleStore,
    instance: &Instance,
    timeout: Duration,
    now: DateTime<Utc>,
) -> SampleOutcome {
    // outer guard in case an adapter ignores its own timeout
    let guard = timeout + Duration::from_secs(1);
    let reply = tokio::time::timeout(
        guard,
        provider.get_metrics(&instance.provider_instance_id, timeout),
    )
    .await;

    let metrics = match reply {
        Ok(Ok(MetricsOutcome::Metrics(m))) => m,
        Ok(Ok(MetricsOutcome::Timeout)) | Err(_) => {
            tracing::debug!(instance_id = %instance.id, "⏱️ [sampler] metrics timeout, missed sample");
            return SampleOutcome::Missed;
        }
        Ok(Err(e)) => {
            tracing::debug!(instance_id = %instance.id, "🔌 [sampler] metrics query failed: {}", e);
            return SampleOutcome::Missed;
        }
    };

    let outcome = samples
        .append_at(
            HeartbeatSample {
                instance_id: instance.id,
                timestamp: now,
                gpu_utilization_pct: metrics.gpu_utilization_pct,
                vram_used_gb: metrics.vram_used_gb,
                cost_accumulated: metrics.cost_accumulated,
                source: SampleSource::Poll,
            },
            now,
        )
        .await;
    match outcome {
        AppendOutcome::Accepted => SampleOutcome::Recorded,
        other => SampleOutcome::Rejected(other),
    }
}
