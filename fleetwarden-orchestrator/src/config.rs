use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use fleetwarden_common::Policy;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProviderCallSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ProviderCallSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub search_timeout: Duration,
    pub provision_timeout: Duration,
    pub max_provision_attempts: usize,
    pub restore_timeout: Duration,
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
    /// Provision a fresh standby for the new primary after cutover.
    pub continuous_protection: bool,
    /// More failovers than this within one hour raises a critical alert.
    pub alert_failovers_per_hour: usize,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(300),
            provision_timeout: Duration::from_secs(600),
            max_provision_attempts: 3,
            restore_timeout: Duration::from_secs(900),
            health_timeout: Duration::from_secs(600),
            health_poll_interval: Duration::from_secs(5),
            continuous_protection: true,
            alert_failovers_per_hour: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReliabilitySettings {
    /// Weight multiplier per step back in history (newest weighs 1.0).
    pub decay: f64,
    pub threshold: f64,
    pub min_records: usize,
    pub cooldown: chrono::Duration,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self {
            decay: 0.7,
            threshold: 0.5,
            min_records: 2,
            cooldown: chrono::Duration::minutes(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub workdir: String,
    pub object_store_uri: Option<String>,
    pub ssh_user: String,
    pub ssh_key_path: Option<String>,
    /// `StrictHostKeyChecking` value passed to ssh (`yes`, `accept-new` or `no`).
    pub ssh_host_key_checking: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            workdir: "/workspace".to_string(),
            object_store_uri: None,
            ssh_user: "root".to_string(),
            ssh_key_path: None,
            ssh_host_key_checking: "accept-new".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StandbySettings {
    /// Preferred provider for standbys; otherwise any provider other than the primary's.
    pub provider: Option<String>,
    pub machine_type: String,
    /// Primary region -> lowest-latency standby region.
    pub region_map: HashMap<String, String>,
}

impl Default for StandbySettings {
    fn default() -> Self {
        Self {
            provider: None,
            machine_type: "cpu-small".to_string(),
            region_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub poll_concurrency: usize,
    pub provider_calls: ProviderCallSettings,
    pub heartbeat_interval_seconds: u64,
    pub sample_retention: usize,
    pub sample_max_age_minutes: i64,
    pub hibernate_countdown_seconds: u64,
    pub keepalive_max_minutes: i64,
    pub enable_test_endpoints: bool,
    pub sync: SyncSettings,
    pub standby: StandbySettings,
    pub failover: FailoverSettings,
    pub reliability: ReliabilitySettings,
    pub http_port: u16,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub notify_webhook_url: Option<String>,
    pub provider_names: Vec<String>,
    pub policy_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            poll_concurrency: 8,
            provider_calls: ProviderCallSettings::default(),
            heartbeat_interval_seconds: 60,
            sample_retention: 30,
            sample_max_age_minutes: 60,
            hibernate_countdown_seconds: 120,
            keepalive_max_minutes: 1440,
            enable_test_endpoints: false,
            sync: SyncSettings::default(),
            standby: StandbySettings::default(),
            failover: FailoverSettings::default(),
            reliability: ReliabilitySettings::default(),
            http_port: 8001,
            database_url: None,
            redis_url: None,
            notify_webhook_url: None,
            provider_names: vec!["mock".to_string()],
            policy_file: None,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("⚠️ [config] invalid value for {}={:?}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key).map(|v| v.to_ascii_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Comma-separated list. Trims whitespace and drops empty entries.
pub fn parse_csv(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// `a=b,c=d` pairs; malformed entries are skipped.
pub fn parse_region_map(raw: Option<&str>) -> HashMap<String, String> {
    parse_csv(raw)
        .into_iter()
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        let secs = |key: &str, default: Duration| Duration::from_secs(env_parse(key, default.as_secs()));

        let mut provider_names = parse_csv(env_opt("PROVIDER").as_deref());
        if provider_names.is_empty() {
            provider_names = d.provider_names.clone();
        }

        Self {
            poll_interval: secs("POLL_INTERVAL_SECONDS", d.poll_interval),
            poll_concurrency: env_parse("POLL_CONCURRENCY", d.poll_concurrency).max(1),
            provider_calls: ProviderCallSettings {
                timeout: secs("PROVIDER_CALL_TIMEOUT_SECONDS", d.provider_calls.timeout),
                max_attempts: env_parse("PROVIDER_MAX_ATTEMPTS", d.provider_calls.max_attempts).max(1),
                backoff_base: Duration::from_millis(env_parse(
                    "PROVIDER_BACKOFF_BASE_MS",
                    d.provider_calls.backoff_base.as_millis() as u64,
                )),
                backoff_max: d.provider_calls.backoff_max,
            },
            heartbeat_interval_seconds: env_parse("HEARTBEAT_INTERVAL_SECONDS", d.heartbeat_interval_seconds),
            sample_retention: env_parse("SAMPLE_RETENTION", d.sample_retention).max(5),
            sample_max_age_minutes: env_parse("SAMPLE_MAX_AGE_MINUTES", d.sample_max_age_minutes),
            hibernate_countdown_seconds: env_parse(
                "HIBERNATE_COUNTDOWN_SECONDS",
                d.hibernate_countdown_seconds,
            ),
            keepalive_max_minutes: env_parse("KEEPALIVE_MAX_MINUTES", d.keepalive_max_minutes),
            enable_test_endpoints: env_bool("ENABLE_TEST_ENDPOINTS", false),
            sync: SyncSettings {
                interval: secs("SYNC_INTERVAL_SECONDS", d.sync.interval),
                failure_threshold: env_parse("SYNC_FAILURE_THRESHOLD", d.sync.failure_threshold),
                backoff_base: secs("SYNC_BACKOFF_BASE_SECONDS", d.sync.backoff_base),
                backoff_max: d.sync.backoff_max,
                workdir: env_opt("SYNC_WORKDIR").unwrap_or(d.sync.workdir),
                object_store_uri: env_opt("SYNC_OBJECT_STORE_URI"),
                ssh_user: env_opt("SYNC_SSH_USER").unwrap_or(d.sync.ssh_user),
                ssh_key_path: env_opt("SYNC_SSH_KEY_FILE"),
                ssh_host_key_checking: env_opt("SYNC_SSH_HOST_KEY_CHECKING")
                    .filter(|v| matches!(v.as_str(), "yes" | "accept-new" | "no"))
                    .unwrap_or(d.sync.ssh_host_key_checking),
            },
            standby: StandbySettings {
                provider: env_opt("STANDBY_PROVIDER"),
                machine_type: env_opt("STANDBY_MACHINE_TYPE").unwrap_or(d.standby.machine_type),
                region_map: parse_region_map(env_opt("STANDBY_REGION_MAP").as_deref()),
            },
            failover: FailoverSettings {
                search_timeout: secs("FAILOVER_SEARCH_TIMEOUT_SECONDS", d.failover.search_timeout),
                provision_timeout: secs("FAILOVER_PROVISION_TIMEOUT_SECONDS", d.failover.provision_timeout),
                max_provision_attempts: env_parse(
                    "FAILOVER_MAX_PROVISION_ATTEMPTS",
                    d.failover.max_provision_attempts,
                )
                .max(1),
                restore_timeout: secs("FAILOVER_RESTORE_TIMEOUT_SECONDS", d.failover.restore_timeout),
                health_timeout: secs("FAILOVER_HEALTH_TIMEOUT_SECONDS", d.failover.health_timeout),
                health_poll_interval: d.failover.health_poll_interval,
                continuous_protection: env_bool("CONTINUOUS_PROTECTION", true),
                alert_failovers_per_hour: env_parse(
                    "ALERT_FAILOVERS_PER_HOUR",
                    d.failover.alert_failovers_per_hour,
                ),
            },
            reliability: ReliabilitySettings {
                decay: env_parse("RELIABILITY_DECAY", d.reliability.decay).clamp(0.01, 1.0),
                threshold: env_parse("RELIABILITY_THRESHOLD", d.reliability.threshold),
                min_records: env_parse("RELIABILITY_MIN_RECORDS", d.reliability.min_records),
                cooldown: chrono::Duration::minutes(env_parse(
                    "RELIABILITY_COOLDOWN_MINUTES",
                    d.reliability.cooldown.num_minutes(),
                )),
            },
            http_port: env_parse("HTTP_PORT", d.http_port),
            database_url: env_opt("DATABASE_URL"),
            redis_url: env_opt("REDIS_URL"),
            notify_webhook_url: env_opt("NOTIFY_WEBHOOK_URL"),
            provider_names,
            policy_file: env_opt("POLICY_FILE").map(PathBuf::from),
        }
    }
}

/// Build a policy from a JSON file when given, otherwise from `POLICY_*` env vars.
pub fn load_policy(path: Option<&Path>) -> anyhow::Result<Policy> {
    let policy = match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read policy file {}", p.display()))?;
            serde_json::from_str::<Policy>(&raw)
                .with_context(|| format!("Invalid policy JSON in {}", p.display()))?
        }
        None => policy_from_env()?,
    };
    policy.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(policy)
}

fn policy_from_env() -> anyhow::Result<Policy> {
    let d = Policy::default();
    let mut protected = HashSet::new();
    for raw in parse_csv(env_opt("POLICY_PROTECTED_INSTANCE_IDS").as_deref()) {
        let id = Uuid::parse_str(&raw)
            .with_context(|| format!("POLICY_PROTECTED_INSTANCE_IDS: invalid id {:?}", raw))?;
        protected.insert(id);
    }
    Ok(Policy {
        idle_utilization_threshold_pct: env_parse(
            "POLICY_IDLE_THRESHOLD_PCT",
            d.idle_utilization_threshold_pct,
        ),
        idle_window_minutes: env_parse("POLICY_IDLE_WINDOW_MINUTES", d.idle_window_minutes),
        orphan_after_minutes: env_parse("POLICY_ORPHAN_AFTER_MINUTES", d.orphan_after_minutes),
        orphan_grace_minutes: env_parse("POLICY_ORPHAN_GRACE_MINUTES", d.orphan_grace_minutes),
        delete_after_idle_hours: env_parse("POLICY_DELETE_AFTER_IDLE_HOURS", d.delete_after_idle_hours),
        min_instance_age_hours: env_parse("POLICY_MIN_INSTANCE_AGE_HOURS", d.min_instance_age_hours),
        protected_instance_ids: protected,
    })
}

/// Holder for the current immutable policy. Readers take an `Arc` snapshot;
/// reload swaps it whole and never mutates a policy in place.
pub struct PolicyHandle {
    current: RwLock<Arc<Policy>>,
    source: Option<PathBuf>,
}

impl PolicyHandle {
    pub fn new(policy: Policy, source: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
            source,
        }
    }

    pub fn current(&self) -> Arc<Policy> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, policy: Policy) -> Result<Arc<Policy>, String> {
        policy.validate()?;
        let next = Arc::new(policy);
        match self.current.write() {
            Ok(mut guard) => *guard = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        Ok(next)
    }

    /// Re-read the original source. On error the previous policy stays in effect.
    pub fn reload(&self) -> anyhow::Result<Arc<Policy>> {
        let policy = load_policy(self.source.as_deref())?;
        let next = self.replace(policy).map_err(|e| anyhow::anyhow!(e))?;
        tracing::info!(
            "🔧 [config] policy reloaded (threshold={}%, protected={})",
            next.idle_utilization_threshold_pct,
            next.protected_instance_ids.len()
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_drops_empty_entries() {
        assert_eq!(parse_csv(Some(" a, ,b ,")), vec!["a", "b"]);
        assert!(parse_csv(None).is_empty());
    }

    #[test]
    fn region_map_parsing() {
        let m = parse_region_map(Some("us-east=us-east1, eu-west = eu-west4, broken, =x"));
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("eu-west").map(String::as_str), Some("eu-west4"));
    }

    #[test]
    fn policy_file_round_trip_and_reload() {
        let dir = std::env::temp_dir().join(format!("fleetwarden-policy-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policy.json");
        std::fs::write(&path, r#"{"idle_utilization_threshold_pct": 7.5}"#).unwrap();

        let policy = load_policy(Some(&path)).unwrap();
        assert_eq!(policy.idle_utilization_threshold_pct, 7.5);
        assert_eq!(policy.idle_window_minutes, Policy::default().idle_window_minutes);

        let handle = PolicyHandle::new(policy, Some(path.clone()));
        std::fs::write(&path, r#"{"idle_utilization_threshold_pct": 12}"#).unwrap();
        handle.reload().unwrap();
        assert_eq!(handle.current().idle_utilization_threshold_pct, 12.0);

        // A broken file keeps the previous policy.
        std::fs::write(&path, r#"{"idle_utilization_threshold_pct": 400}"#).unwrap();
        assert!(handle.reload().is_err());
        assert_eq!(handle.current().idle_utilization_threshold_pct, 12.0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
