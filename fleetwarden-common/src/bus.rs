use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels
// -----------------------------------------------------------------------------

pub const CHANNEL_FLEET_COMMANDS: &str = "fleet_commands";
pub const CHANNEL_NOTIFICATIONS: &str = "fleet_notifications";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:CANCEL_FAILOVER")]
    CancelFailover,
    #[serde(rename = "CMD:KEEPALIVE")]
    KeepAlive,
    #[serde(rename = "CMD:SYNC_NOW")]
    SyncNow,
    #[serde(rename = "CMD:RELOAD_POLICY")]
    ReloadPolicy,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::CancelFailover => "CMD:CANCEL_FAILOVER",
            CommandType::KeepAlive => "CMD:KEEPALIVE",
            CommandType::SyncNow => "CMD:SYNC_NOW",
            CommandType::ReloadPolicy => "CMD:RELOAD_POLICY",
        }
    }
}

/// Wire shape of a command published on `fleet_commands`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    #[serde(default)]
    pub minutes: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

// -----------------------------------------------------------------------------
// Operator notifications
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationEnvelope {
    pub event_id: Uuid,
    pub severity: Severity,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
}

impl NotificationEnvelope {
    pub fn new(severity: Severity, message: &str, source: &str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            severity,
            message: message.to_string(),
            occurred_at: Utc::now(),
            source: source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parses_from_wire() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"CMD:CANCEL_FAILOVER","instance_id":"{}","reason":"manual"}}"#,
            id
        );
        let cmd: Command = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd.command_type, CommandType::CancelFailover);
        assert_eq!(cmd.instance_id, Some(id));
        assert_eq!(cmd.reason.as_deref(), Some("manual"));

        let reload: Command = serde_json::from_str(r#"{"type":"CMD:RELOAD_POLICY"}"#).unwrap();
        assert_eq!(reload.command_type.as_str(), "CMD:RELOAD_POLICY");
    }
}
