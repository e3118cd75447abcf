use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleetwarden_common::{FleetError, Instance, InstanceKind, InstanceStatus, LivenessState};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Per-instance bookkeeping that outlives a single poll tick.
#[derive(Debug, Clone, Default)]
pub struct Tracking {
    pub orphan_observations: u32,
    /// Start of the current idle/orphaned/lost streak.
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub keepalive_until: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub provider_terminated: bool,
    pub last_state: Option<LivenessState>,
    pub last_action: Option<String>,
    pub last_warning: Option<String>,
    /// Checkpoint taken by the last hibernate.
    pub snapshot_ref: Option<String>,
}

struct Entry {
    instance: Instance,
    tracking: Tracking,
    lock: Arc<Mutex<()>>,
}

/// Instance roster shared by the poll loop, the heartbeat path and the
/// failover driver. Status changes go through `compare_and_set_status`; the
/// per-instance lock serializes actions on one instance.
#[derive(Default)]
pub struct Roster {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, instance: Instance) -> Uuid {
        let id = instance.id;
        self.entries.write().await.insert(
            id,
            Entry {
                instance,
                tracking: Tracking::default(),
                lock: Arc::new(Mutex::new(())),
            },
        );
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<Instance> {
        self.entries.read().await.get(&id).map(|e| e.instance.clone())
    }

    pub async fn get_with_tracking(&self, id: Uuid) -> Option<(Instance, Tracking)> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| (e.instance.clone(), e.tracking.clone()))
    }

    pub async fn tracking(&self, id: Uuid) -> Option<Tracking> {
        self.entries.read().await.get(&id).map(|e| e.tracking.clone())
    }

    pub async fn list(&self) -> Vec<Instance> {
        let mut out: Vec<Instance> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.instance.clone())
            .collect();
        out.sort_by_key(|i| i.created_at);
        out
    }

    /// GPU primaries that are not archived.
    pub async fn list_primaries(&self) -> Vec<Instance> {
        self.list()
            .await
            .into_iter()
            .filter(|i| i.kind == InstanceKind::Gpu && i.status != InstanceStatus::Destroyed)
            .collect()
    }

    pub async fn find_by_provider_id(&self, provider: &str, provider_instance_id: &str) -> Option<Uuid> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| {
                e.instance.provider == provider
                    && e.instance.provider_instance_id == provider_instance_id
            })
            .map(|e| e.instance.id)
    }

    pub async fn lock_for(&self, id: Uuid) -> Option<Arc<Mutex<()>>> {
        self.entries.read().await.get(&id).map(|e| e.lock.clone())
    }

    /// Set status only when the current one is in `allowed`.
    /// Returns the previous status on success, `None` when the guard rejected it.
    pub async fn compare_and_set_status(
        &self,
        id: Uuid,
        allowed: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<InstanceStatus>, FleetError> {
        let mut map = self.entries.write().await;
        let entry = map
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("instance {}", id)))?;
        let from = entry.instance.status;
        if !allowed.contains(&from) {
            return Ok(None);
        }
        entry.instance.status = to;
        Ok(Some(from))
    }

    pub async fn update_instance<F>(&self, id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Instance),
    {
        match self.entries.write().await.get_mut(&id) {
            Some(e) => {
                f(&mut e.instance);
                true
            }
            None => false,
        }
    }

    pub async fn update_tracking<F>(&self, id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Tracking),
    {
        match self.entries.write().await.get_mut(&id) {
            Some(e) => {
                f(&mut e.tracking);
                true
            }
            None => false,
        }
    }

    pub async fn set_keepalive(&self, id: Uuid, until: DateTime<Utc>) -> Result<(), FleetError> {
        if self.update_tracking(id, |t| t.keepalive_until = Some(until)).await {
            Ok(())
        } else {
            Err(FleetError::NotFound(format!("instance {}", id)))
        }
    }
}
