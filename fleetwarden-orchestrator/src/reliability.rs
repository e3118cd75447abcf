//! Append-only attempt history per (provider, machine).
//!
//! The score is an exponentially weighted success rate computed on read:
//! the newest record weighs 1.0, the one before it `decay`, then `decay^2`
//! and so on. A machine with no history scores 1.0.
//!
//! A blacklist event is appended when a record pushes the score below the
//! threshold (with at least `min_records` records). `is_blacklisted` is true
//! while the score stays below threshold and the latest event is younger
//! than the cooldown, so expiry needs no caller action.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fleetwarden_common::{ReliabilityOutcome, ReliabilityRecord};
use sqlx::{Pool, Postgres};
use tokio::sync::RwLock;

use crate::config::ReliabilitySettings;

type MachineKey = (String, String);

#[derive(Debug, Default, Clone)]
struct MachineHistory {
    records: Vec<ReliabilityRecord>,
    blacklisted_at: Vec<DateTime<Utc>>,
}

pub struct ReliabilityLedger {
    settings: ReliabilitySettings,
    history: RwLock<HashMap<MachineKey, MachineHistory>>,
    db: Option<Pool<Postgres>>,
}

fn key(provider: &str, machine_id: &str) -> MachineKey {
    (provider.to_lowercase(), machine_id.to_string())
}

fn weighted_score(records: &[ReliabilityRecord], decay: f64) -> f64 {
    if records.is_empty() {
        return 1.0;
    }
    let mut weight = 1.0;
    let mut total = 0.0;
    let mut good = 0.0;
    for r in records.iter().rev() {
        total += weight;
        if r.outcome.is_success() {
            good += weight;
        }
        weight *= decay;
    }
    good / total
}

impl ReliabilityLedger {
    pub fn new(settings: ReliabilitySettings, db: Option<Pool<Postgres>>) -> Self {
        Self {
            settings,
            history: RwLock::new(HashMap::new()),
            db,
        }
    }

    pub async fn record(&self, provider: &str, machine_id: &str, outcome: ReliabilityOutcome) {
        self.record_at(provider, machine_id, outcome, Utc::now()).await;
    }

    pub async fn record_at(
        &self,
        provider: &str,
        machine_id: &str,
        outcome: ReliabilityOutcome,
        at: DateTime<Utc>,
    ) {
        let record = ReliabilityRecord {
            provider: provider.to_lowercase(),
            machine_id: machine_id.to_string(),
            outcome,
            timestamp: at,
        };
        let blacklisted = self.append(record.clone()).await;
        if blacklisted {
            tracing::warn!(
                provider,
                machine_id,
                "⛔ [reliability] machine blacklisted for {} min",
                self.settings.cooldown.num_minutes()
            );
        } else {
            tracing::debug!(provider, machine_id, "📒 [reliability] {}", outcome.as_str());
        }

        if let Some(db) = &self.db {
            let res = sqlx::query(
                "INSERT INTO reliability_records (provider, machine_id, outcome, recorded_at)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(&record.provider)
            .bind(&record.machine_id)
            .bind(record.outcome.as_str())
            .bind(record.timestamp)
            .execute(db)
            .await;
            if let Err(e) = res {
                tracing::warn!("⚠️ [reliability] failed to persist record: {}", e);
            }
        }
    }

    /// Returns true when this record triggered a blacklist event.
    async fn append(&self, record: ReliabilityRecord) -> bool {
        let mut map = self.history.write().await;
        let h = map
            .entry(key(&record.provider, &record.machine_id))
            .or_default();
        let at = record.timestamp;
        h.records.push(record);
        let score = weighted_score(&h.records, self.settings.decay);
        if h.records.len() >= self.settings.min_records && score < self.settings.threshold {
            h.blacklisted_at.push(at);
            return true;
        }
        false
    }

    pub async fn score(&self, provider: &str, machine_id: &str) -> f64 {
        let map = self.history.read().await;
        match map.get(&key(provider, machine_id)) {
            Some(h) => weighted_score(&h.records, self.settings.decay),
            None => 1.0,
        }
    }

    pub async fn is_blacklisted(&self, provider: &str, machine_id: &str) -> bool {
        self.is_blacklisted_at(provider, machine_id, Utc::now()).await
    }

    pub async fn is_blacklisted_at(&self, provider: &str, machine_id: &str, now: DateTime<Utc>) -> bool {
        let map = self.history.read().await;
        let Some(h) = map.get(&key(provider, machine_id)) else {
            return false;
        };
        let Some(last) = h.blacklisted_at.last() else {
            return false;
        };
        weighted_score(&h.records, self.settings.decay) < self.settings.threshold
            && now - *last < self.settings.cooldown
    }

    pub async fn records(&self, provider: &str, machine_id: &str) -> Vec<ReliabilityRecord> {
        self.history
            .read()
            .await
            .get(&key(provider, machine_id))
            .map(|h| h.records.clone())
            .unwrap_or_default()
    }

    /// Replay persisted records (oldest first) so blacklist events are rebuilt.
    pub async fn load_from_db(&self) -> anyhow::Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let rows: Vec<(String, String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT provider, machine_id, outcome, recorded_at
             FROM reliability_records
             WHERE recorded_at > NOW() - INTERVAL '7 days'
             ORDER BY recorded_at ASC",
        )
        .fetch_all(db)
        .await?;

        let mut loaded = 0;
        for (provider, machine_id, outcome, at) in rows {
            let outcome = match outcome.as_str() {
                "success" => ReliabilityOutcome::Success,
                "timeout" => ReliabilityOutcome::Timeout,
                "provisioning_failure" => ReliabilityOutcome::ProvisioningFailure,
                "premature_termination" => ReliabilityOutcome::PrematureTermination,
                other => {
                    tracing::warn!("⚠️ [reliability] skipping unknown outcome '{}'", other);
                    continue;
                }
            };
            self.append(ReliabilityRecord {
                provider,
                machine_id,
                outcome,
                timestamp: at,
            })
            .await;
            loaded += 1;
        }
        tracing::info!("📒 [reliability] loaded {} record(s)", loaded);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ledger() -> ReliabilityLedger {
        ReliabilityLedger::new(ReliabilitySettings::default(), None)
    }

    #[tokio::test]
    async fn unknown_machine_scores_perfect() {
        let l = ledger();
        assert_eq!(l.score("vast", "m1").await, 1.0);
        assert!(!l.is_blacklisted("vast", "m1").await);
    }

    #[tokio::test]
    async fn newest_records_weigh_most() {
        let l = ledger();
        let t0 = Utc::now();
        l.record_at("vast", "m1", ReliabilityOutcome::Timeout, t0).await;
        l.record_at("vast", "m1", ReliabilityOutcome::Success, t0 + Duration::seconds(1))
            .await;
        // 1.0 / (1.0 + 0.7)
        let s = l.score("vast", "m1").await;
        assert!((s - 1.0 / 1.7).abs() < 1e-9);
        assert!(!l.is_blacklisted("vast", "m1").await);
    }

    #[tokio::test]
    async fn blacklist_expires_after_cooldown() {
        let l = ledger();
        let t0 = Utc::now();
        l.record_at("vast", "m1", ReliabilityOutcome::ProvisioningFailure, t0).await;
        // a single record is not enough evidence
        assert!(!l.is_blacklisted_at("vast", "m1", t0).await);
        l.record_at("vast", "m1", ReliabilityOutcome::PrematureTermination, t0).await;
        assert!(l.is_blacklisted_at("vast", "m1", t0).await);
        assert!(l.is_blacklisted_at("vast", "m1", t0 + Duration::minutes(59)).await);
        assert!(!l.is_blacklisted_at("vast", "m1", t0 + Duration::minutes(61)).await);
        // other machines on the same provider are unaffected
        assert!(!l.is_blacklisted_at("vast", "m2", t0).await);
    }

    #[tokio::test]
    async fn recovery_above_threshold_clears_blacklist() {
        let l = ledger();
        let t0 = Utc::now();
        l.record_at("gcp", "m1", ReliabilityOutcome::Timeout, t0).await;
        l.record_at("gcp", "m1", ReliabilityOutcome::Timeout, t0).await;
        assert!(l.is_blacklisted_at("gcp", "m1", t0).await);
        for _ in 0..3 {
            l.record_at("gcp", "m1", ReliabilityOutcome::Success, t0).await;
        }
        assert!(l.score("gcp", "m1").await >= 0.5);
        assert!(!l.is_blacklisted_at("gcp", "m1", t0).await);
        assert_eq!(l.records("gcp", "m1").await.len(), 5);
    }
}
