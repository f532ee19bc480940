//! Read-only snapshot of pool state.

use serde::Serialize;

use crate::config::{PoolConfig, PoolMode};

/// Pool state as of the last event the supervisor handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Ephemeral or persistent.
    pub mode: PoolMode,
    /// Configured concurrency cap or worker count.
    pub size: usize,
    /// Jobs bound to a unit.
    pub active_jobs: usize,
    /// Jobs waiting for a unit.
    pub queued_jobs: usize,
    /// Units currently alive. Below `size` in persistent mode while restarts
    /// are pending or the restart budget is exhausted.
    pub live_units: usize,
    /// Live units with no job bound.
    pub idle_units: usize,
    /// Set once shutdown has begun.
    pub shutting_down: bool,
}

impl PoolStats {
    pub(crate) const fn initial(config: &PoolConfig) -> Self {
        Self {
            mode: config.mode,
            size: config.size,
            active_jobs: 0,
            queued_jobs: 0,
            live_units: 0,
            idle_units: 0,
            shutting_down: false,
        }
    }

    /// Jobs the pool has accepted and not yet settled.
    pub const fn pending_jobs(&self) -> usize {
        self.active_jobs + self.queued_jobs
    }
}
