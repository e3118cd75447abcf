pub mod actions;
pub mod api;
pub mod commands;
pub mod config;
pub mod decision;
pub mod failover;
pub mod fleet;
pub mod heartbeat;
pub mod liveness;
pub mod logger;
pub mod migrations;
pub mod notifier;
pub mod poll_job;
pub mod provider_manager;
pub mod reliability;
pub mod retry;
pub mod roster;
pub mod sample_store;
pub mod sampler;
pub mod standby;
pub mod state_machine;
pub mod sync_engine;
pub mod sync_job;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
