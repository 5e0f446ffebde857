//! Bounded slot pool.
//!
//! The pool is a channel of capacity N pre-seeded with N empty slots. Acquiring
//! receives a slot, dropping the lease sends it back. The receiver sits behind a
//! tokio mutex, which hands out the lock in FIFO order, so blocked callers are
//! served in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::SlotId;

struct SlotEntry<W> {
    slot_id: SlotId,
    worker: Option<W>,
}

struct PoolConnection<W> {
    pool_tx: mpsc::Sender<SlotEntry<W>>,
    pool_available: Arc<AtomicUsize>,
}

/// Exclusive ownership of one slot and whatever worker it holds.
///
/// The slot goes back to the pool on drop. A worker removed with [`take`](Self::take)
/// and not put back is not returned: the slot is released empty.
pub struct SlotLease<W> {
    slot_id: SlotId,
    worker: Option<W>,
    pool: PoolConnection<W>,
}

impl<W> SlotLease<W> {
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub fn worker(&self) -> Option<&W> {
        self.worker.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_none()
    }

    /// Remove the worker, leaving the slot empty.
    pub fn take(&mut self) -> Option<W> {
        self.worker.take()
    }

    /// Remove the worker only if `predicate` holds for it.
    pub fn take_if(&mut self, predicate: impl FnOnce(&W) -> bool) -> Option<W> {
        self.worker.take_if(|w| predicate(&*w))
    }

    /// Park a worker in the slot, returning the one it replaces.
    pub fn put(&mut self, worker: W) -> Option<W> {
        self.worker.replace(worker)
    }
}

impl<W> Drop for SlotLease<W> {
    fn drop(&mut self) {
        let entry = SlotEntry {
            slot_id: self.slot_id,
            worker: self.worker.take(),
        };

        // Count first so a waiter that receives the entry immediately never
        // observes the counter below zero.
        self.pool.pool_available.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.pool.pool_tx.try_send(entry) {
            self.pool.pool_available.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(slot = %self.slot_id, error = %e, "Failed to return slot to pool");
        }
    }
}

/// Fixed set of N slots with blocking, exclusive checkout.
pub struct SlotPool<W> {
    available_rx: Mutex<mpsc::Receiver<SlotEntry<W>>>,
    available_tx: mpsc::Sender<SlotEntry<W>>,
    slot_ids: Vec<SlotId>,
    available_count: Arc<AtomicUsize>,
}

impl<W> SlotPool<W> {
    /// Create a pool of `num_slots` empty slots. Zero is clamped to one.
    pub fn new(num_slots: usize) -> Self {
        let num_slots = if num_slots == 0 {
            tracing::warn!("Slot pool requested with zero slots, using one");
            1
        } else {
            num_slots
        };

        let (tx, rx) = mpsc::channel(num_slots);
        let slot_ids: Vec<SlotId> = (0..num_slots).map(|_| SlotId::new()).collect();
        let available_count = Arc::new(AtomicUsize::new(0));

        for slot_id in &slot_ids {
            let entry = SlotEntry {
                slot_id: *slot_id,
                worker: None,
            };
            if let Err(e) = tx.try_send(entry) {
                tracing::error!(slot = %slot_id, error = %e, "Failed to seed slot");
            } else {
                available_count.fetch_add(1, Ordering::AcqRel);
            }
        }

        tracing::debug!(num_slots, "Slot pool created");

        Self {
            available_rx: Mutex::new(rx),
            available_tx: tx,
            slot_ids,
            available_count,
        }
    }

    fn lease(&self, entry: SlotEntry<W>) -> SlotLease<W> {
        self.available_count.fetch_sub(1, Ordering::AcqRel);
        SlotLease {
            slot_id: entry.slot_id,
            worker: entry.worker,
            pool: PoolConnection {
                pool_tx: self.available_tx.clone(),
                pool_available: Arc::clone(&self.available_count),
            },
        }
    }

    /// Wait for a free slot. Never fails and never times out.
    pub async fn acquire(&self) -> SlotLease<W> {
        let mut rx = self.available_rx.lock().await;
        match rx.recv().await {
            Some(entry) => self.lease(entry),
            // The pool owns a sender, so the channel cannot close while `self` lives.
            None => unreachable!("slot pool channel closed while pool alive"),
        }
    }

    /// Take a free slot if one is available right now.
    pub fn try_acquire(&self) -> Option<SlotLease<W>> {
        let mut rx = self.available_rx.try_lock().ok()?;
        let entry = rx.try_recv().ok()?;
        Some(self.lease(entry))
    }

    pub fn num_slots(&self) -> usize {
        self.slot_ids.len()
    }

    pub fn slot_ids(&self) -> &[SlotId] {
        &self.slot_ids
    }

    pub fn available(&self) -> usize {
        self.available_count.load(Ordering::Acquire)
    }
}
