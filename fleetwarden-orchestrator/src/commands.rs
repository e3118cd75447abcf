use std::sync::Arc;

use anyhow::Context;
use fleetwarden_common::bus::{Command, CommandType, CHANNEL_FLEET_COMMANDS};
use fleetwarden_common::FleetError;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::fleet::Fleet;

/// Parse a `fleet_commands` payload. `None` for unknown types or bad JSON.
pub fn parse_command(payload: &str) -> Option<Command> {
    let event: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("⚠️ [commands] invalid JSON payload: {}", e);
            return None;
        }
    };
    let event_type = event["type"].as_str().unwrap_or("").to_string();
    match serde_json::from_value::<Command>(event) {
        Ok(cmd) => Some(cmd),
        Err(_) => {
            tracing::warn!("⚠️ [commands] unknown or malformed command type: {}", event_type);
            None
        }
    }
}

fn require_instance(cmd: &Command) -> Result<uuid::Uuid, FleetError> {
    cmd.instance_id
        .ok_or_else(|| FleetError::NotFound(format!("{} without instance_id", cmd.command_type.as_str())))
}

pub async fn handle_command(fleet: &Fleet, cmd: Command) -> Result<(), FleetError> {
    tracing::info!(
        correlation_id = cmd.correlation_id.as_deref().unwrap_or(""),
        "📥 [commands] {}",
        cmd.command_type.as_str()
    );
    match cmd.command_type {
        CommandType::CancelFailover => {
            let id = require_instance(&cmd)?;
            let reason = cmd.reason.as_deref().unwrap_or("cancelled via command bus");
            fleet.failover.cancel(id, reason)?;
        }
        CommandType::KeepAlive => {
            let id = require_instance(&cmd)?;
            fleet.keepalive(id, cmd.minutes.unwrap_or(60)).await?;
        }
        CommandType::SyncNow => {
            let id = require_instance(&cmd)?;
            fleet.sync.sync_now(id).await?;
        }
        CommandType::ReloadPolicy => {
            fleet.reload_policy()?;
        }
    }
    Ok(())
}

/// Subscribe to `fleet_commands` and dispatch each command on its own task.
pub async fn listen(fleet: Arc<Fleet>, client: redis::Client, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("Failed to open Redis pubsub connection")?;
    pubsub
        .subscribe(CHANNEL_FLEET_COMMANDS)
        .await
        .context("Failed to subscribe to fleet commands")?;
    tracing::info!("🎧 Listening on Redis channel '{}'", CHANNEL_FLEET_COMMANDS);

    let mut stream = pubsub.on_message();
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            msg = stream.next() => msg,
        };
        let Some(msg) = msg else {
            anyhow::bail!("Redis pubsub stream closed");
        };
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("⚠️ [commands] unreadable payload: {}", e);
                continue;
            }
        };
        tracing::debug!("📩 [commands] received: {}", payload);
        let Some(cmd) = parse_command(&payload) else {
            continue;
        };
        let fleet = fleet.clone();
        tokio::spawn(async move {
            let kind = cmd.command_type.as_str();
            if let Err(e) = handle_command(&fleet, cmd).await {
                tracing::warn!("⚠️ [commands] {} failed: {}", kind, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        let id = uuid::Uuid::new_v4();
        let cmd = parse_command(&format!(
            r#"{{"type":"CMD:CANCEL_FAILOVER","instance_id":"{}","reason":"manual"}}"#,
            id
        ))
        .unwrap();
        assert_eq!(cmd.command_type, CommandType::CancelFailover);
        assert_eq!(cmd.instance_id, Some(id));
        assert_eq!(cmd.reason.as_deref(), Some("manual"));

        let cmd = parse_command(r#"{"type":"CMD:RELOAD_POLICY"}"#).unwrap();
        assert_eq!(cmd.command_type, CommandType::ReloadPolicy);
    }

    #[test]
    fn unknown_types_and_garbage_are_ignored() {
        assert!(parse_command(r#"{"type":"CMD:PROVISION"}"#).is_none());
        assert!(parse_command("not json").is_none());
    }
}
