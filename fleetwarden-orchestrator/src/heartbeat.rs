use chrono::{DateTime, Duration, Utc};
use fleetwarden_common::{Action, FleetError, HeartbeatSample, SampleSource};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decision;
use crate::fleet::Fleet;
use crate::sample_store::AppendOutcome;

/// Push report from the instance-resident agent.
#[derive(Deserialize, Debug, Clone)]
pub struct HeartbeatReport {
    pub instance_id: Uuid,
    pub gpu_utilization: f64,
    #[serde(default)]
    pub vram_used_gb: f64,
    pub cpu_utilization: Option<f64>,
    pub ram_used_gb: Option<f64>,
    pub disk_used_gb: Option<f64>,
    #[serde(default)]
    pub cost_accumulated: f64,
    pub status: Option<String>,
    pub uptime_seconds: Option<u64>,
    /// Agent clock; the receive time is used when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AdvisoryAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<u64>,
}

#[derive(Serialize, Debug, Clone)]
pub struct HeartbeatAck {
    pub next_heartbeat_in_seconds: u64,
    pub actions: Vec<AdvisoryAction>,
}

/// Append the report to the rolling window and compute advisories.
///
/// Never takes the per-instance action lock: the poll loop may be acting on the
/// same instance and ingestion must not wait for it.
pub async fn ingest(fleet: &Fleet, report: HeartbeatReport, now: DateTime<Utc>) -> Result<HeartbeatAck, FleetError> {
    let (instance, tracking) = fleet
        .roster
        .get_with_tracking(report.instance_id)
        .await
        .ok_or_else(|| FleetError::NotFound(format!("instance {}", report.instance_id)))?;

    let outcome = fleet
        .samples
        .append_at(
            HeartbeatSample {
                instance_id: instance.id,
                timestamp: report.timestamp.unwrap_or(now),
                gpu_utilization_pct: report.gpu_utilization,
                vram_used_gb: report.vram_used_gb,
                cost_accumulated: report.cost_accumulated,
                source: SampleSource::Agent,
            },
            now,
        )
        .await;
    match outcome {
        AppendOutcome::Accepted => {
            tracing::debug!(
                instance_id = %instance.id,
                gpu_util = report.gpu_utilization,
                status = report.status.as_deref().unwrap_or(""),
                uptime = report.uptime_seconds.unwrap_or(0),
                "💓 [heartbeat] sample accepted"
            );
        }
        rejected => {
            tracing::warn!(instance_id = %instance.id, "💓 [heartbeat] report ignored: {:?}", rejected);
        }
    }

    if !instance.has_agent {
        fleet.roster.update_instance(instance.id, |i| i.has_agent = true).await;
    }

    let policy = fleet.policy.current();
    let state = fleet.classify(&instance, &tracking, &policy, now).await;
    let ctx = fleet.evaluation_context(&instance, &tracking).await;
    let action = decision::evaluate(&instance, state, Some(&policy), &ctx, now);

    let mut actions = Vec::new();
    let countdown = fleet.settings.hibernate_countdown_seconds;
    match action {
        Action::Hibernate => actions.push(AdvisoryAction {
            action_type: "hibernate".to_string(),
            message: format!("hibernating in {}s, save state now", countdown),
            countdown_seconds: Some(countdown),
        }),
        Action::Pause => actions.push(AdvisoryAction {
            action_type: "pause".to_string(),
            message: format!("pausing in {}s due to inactivity", countdown),
            countdown_seconds: Some(countdown),
        }),
        Action::Warn { message } => actions.push(AdvisoryAction {
            action_type: "warning".to_string(),
            message,
            countdown_seconds: None,
        }),
        _ => {}
    }

    let interval = fleet.settings.heartbeat_interval_seconds;
    if let Some(until) = tracking.keepalive_until {
        if until > now && until <= now + Duration::seconds(interval as i64) {
            actions.push(AdvisoryAction {
                action_type: "keepalive_expiring".to_string(),
                message: format!("keep-alive expires at {}", until.to_rfc3339()),
                countdown_seconds: Some((until - now).num_seconds().max(0) as u64),
            });
        }
    }

    Ok(HeartbeatAck {
        next_heartbeat_in_seconds: interval,
        actions,
    })
}
