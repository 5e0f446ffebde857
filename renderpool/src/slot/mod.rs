//! Worker slots.
//!
//! A slot is one of N fixed ownership tokens gating access to worker processes.
//! Holding a [`SlotLease`] is both the mutual-exclusion mechanism and the unit of
//! ownership for the worker parked in that slot:
//! - `SlotPool::acquire` blocks (FIFO, no timeout) until a slot is free
//! - dropping the lease returns the slot, with or without its worker

mod pool;

pub use pool::{SlotLease, SlotPool};

use serde::{Deserialize, Serialize};

/// Identity of a slot for the lifetime of the pool.
///
/// UUID v4 keeps slot identities distinct from positions and from worker pids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(uuid::Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
