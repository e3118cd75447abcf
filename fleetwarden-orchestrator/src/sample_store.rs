use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleetwarden_common::HeartbeatSample;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Accepted,
    /// Older than (or equal to) the newest stored sample.
    OutOfOrder,
    /// Arrived sooner than the minimum spacing after the last accepted sample.
    TooFrequent,
    /// Non-finite or out-of-range values.
    Malformed,
    /// Timestamp further ahead of the receiver's clock than the allowed skew.
    FutureDated,
}

#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<HeartbeatSample>,
    ignored: u64,
}

/// Rolling per-instance sample store shared by the heartbeat path and the poller.
/// Only append and evict; stored samples are never edited.
pub struct SampleStore {
    retention: usize,
    max_age: Duration,
    min_spacing: Duration,
    max_skew: Duration,
    windows: RwLock<HashMap<Uuid, Arc<Mutex<SampleWindow>>>>,
}

impl SampleStore {
    pub fn new(retention: usize, max_age_minutes: i64, min_spacing_seconds: i64) -> Self {
        Self {
            retention: retention.max(5),
            max_age: Duration::minutes(max_age_minutes.max(1)),
            min_spacing: Duration::seconds(min_spacing_seconds.max(0)),
            max_skew: Duration::minutes(2),
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// How far ahead of the receiving clock a sample may be stamped.
    pub fn with_max_skew(mut self, max_skew: Duration) -> Self {
        self.max_skew = max_skew.max(Duration::zero());
        self
    }

    async fn window(&self, instance_id: Uuid) -> Arc<Mutex<SampleWindow>> {
        if let Some(w) = self.windows.read().await.get(&instance_id) {
            return w.clone();
        }
        let mut map = self.windows.write().await;
        map.entry(instance_id).or_default().clone()
    }

    pub async fn append(&self, sample: HeartbeatSample) -> AppendOutcome {
        self.append_at(sample, Utc::now()).await
    }

    /// Append relative to `now`. A future-dated sample would make every later
    /// real sample look out of order, so it is rejected outright.
    pub async fn append_at(&self, sample: HeartbeatSample, now: DateTime<Utc>) -> AppendOutcome {
        let window = self.window(sample.instance_id).await;
        let mut w = window.lock().await;

        let valid = sample.gpu_utilization_pct.is_finite()
            && (0.0..=100.0).contains(&sample.gpu_utilization_pct)
            && sample.vram_used_gb.is_finite()
            && sample.vram_used_gb >= 0.0
            && sample.cost_accumulated.is_finite();
        if !valid {
            w.ignored += 1;
            return AppendOutcome::Malformed;
        }
        if sample.timestamp > now + self.max_skew {
            w.ignored += 1;
            return AppendOutcome::FutureDated;
        }

        if let Some(last) = w.samples.back() {
            if sample.timestamp <= last.timestamp {
                w.ignored += 1;
                return AppendOutcome::OutOfOrder;
            }
            if sample.timestamp - last.timestamp < self.min_spacing {
                w.ignored += 1;
                return AppendOutcome::TooFrequent;
            }
        }

        let newest = sample.timestamp;
        w.samples.push_back(sample);
        let cutoff = newest - self.max_age;
        while w.samples.len() > self.retention
            || w.samples.front().map(|s| s.timestamp < cutoff).unwrap_or(false)
        {
            w.samples.pop_front();
        }
        AppendOutcome::Accepted
    }

    pub async fn snapshot(&self, instance_id: Uuid) -> Vec<HeartbeatSample> {
        let w = self.windows.read().await.get(&instance_id).cloned();
        match w {
            Some(w) => w.lock().await.samples.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn last_seen(&self, instance_id: Uuid) -> Option<DateTime<Utc>> {
        let w = self.windows.read().await.get(&instance_id).cloned()?;
        let guard = w.lock().await;
        guard.samples.back().map(|s| s.timestamp)
    }

    pub async fn latest(&self, instance_id: Uuid) -> Option<HeartbeatSample> {
        let w = self.windows.read().await.get(&instance_id).cloned()?;
        let guard = w.lock().await;
        guard.samples.back().cloned()
    }

    pub async fn ignored_count(&self, instance_id: Uuid) -> u64 {
        let w = self.windows.read().await.get(&instance_id).cloned();
        match w {
            Some(w) => w.lock().await.ignored,
            None => 0,
        }
    }

    pub async fn forget(&self, instance_id: Uuid) {
        self.windows.write().await.remove(&instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwarden_common::SampleSource;

    fn sample(id: Uuid, at: DateTime<Utc>, util: f64) -> HeartbeatSample {
        HeartbeatSample {
            instance_id: id,
            timestamp: at,
            gpu_utilization_pct: util,
            vram_used_gb: 1.0,
            cost_accumulated: 0.0,
            source: SampleSource::Agent,
        }
    }

    #[tokio::test]
    async fn out_of_order_samples_do_not_advance_last_seen() {
        let store = SampleStore::new(10, 60, 0);
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        assert_eq!(store.append(sample(id, t0, 5.0)).await, AppendOutcome::Accepted);
        assert_eq!(
            store.append(sample(id, t0 - Duration::seconds(30), 5.0)).await,
            AppendOutcome::OutOfOrder
        );
        assert_eq!(store.last_seen(id).await, Some(t0));
        assert_eq!(store.ignored_count(id).await, 1);
    }

    #[tokio::test]
    async fn future_dated_samples_cannot_mask_silence() {
        let store = SampleStore::new(10, 60, 0);
        let id = Uuid::new_v4();
        let now = Utc::now();
        assert_eq!(
            store.append_at(sample(id, now + Duration::days(1), 80.0), now).await,
            AppendOutcome::FutureDated
        );
        assert_eq!(store.last_seen(id).await, None);

        // small clock drift is tolerated
        let drift = now + Duration::seconds(30);
        assert_eq!(store.append_at(sample(id, drift, 80.0), now).await, AppendOutcome::Accepted);
        assert_eq!(
            store
                .append_at(sample(id, now + Duration::minutes(2), 80.0), now + Duration::minutes(2))
                .await,
            AppendOutcome::Accepted
        );

        let later = now + Duration::minutes(40);
        assert_eq!(
            crate::liveness::classify(later, &store.snapshot(id).await, &fleetwarden_common::Policy::default()),
            fleetwarden_common::LivenessState::Lost
        );
    }

    #[tokio::test]
    async fn malformed_and_too_frequent_samples_are_ignored() {
        let store = SampleStore::new(10, 60, 30);
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        assert_eq!(store.append(sample(id, t0, f64::NAN)).await, AppendOutcome::Malformed);
        assert_eq!(store.append(sample(id, t0, 140.0)).await, AppendOutcome::Malformed);
        assert_eq!(store.append(sample(id, t0, 1.0)).await, AppendOutcome::Accepted);
        assert_eq!(
            store.append(sample(id, t0 + Duration::seconds(5), 1.0)).await,
            AppendOutcome::TooFrequent
        );
        assert_eq!(store.snapshot(id).await.len(), 1);
    }

    #[tokio::test]
    async fn window_is_bounded_by_count_and_age() {
        let store = SampleStore::new(5, 10, 0);
        let id = Uuid::new_v4();
        let t0 = Utc::now() - Duration::minutes(30);
        for i in 0..8 {
            store
                .append(sample(id, t0 + Duration::minutes(i), i as f64))
                .await;
        }
        let snap = store.snapshot(id).await;
        assert_eq!(snap.len(), 5);
        assert_eq!(snap[0].gpu_utilization_pct, 3.0);

        // a sample 20 minutes later evicts everything older than 10 minutes
        store
            .append(sample(id, t0 + Duration::minutes(27), 50.0))
            .await;
        assert_eq!(store.snapshot(id).await.len(), 1);
    }
}
