//! Per-key population locks.
//!
//! Slots are created lazily on first use and removed once no guard or waiter
//! references them, so the arena only ever holds keys with a population in
//! flight.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots = Arc<DashMap<String, Arc<Mutex<()>>>>;

#[derive(Default)]
pub(crate) struct PopulationLocks {
    slots: Slots,
}

impl PopulationLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive population rights over `key`.
    ///
    /// Dropping the returned future before it resolves leaves no slot behind.
    pub(crate) async fn acquire(&self, key: &str) -> PopulationGuard {
        let slot = Arc::clone(self.slots.entry(key.to_owned()).or_default().value());
        let lease = Lease {
            key: key.to_owned(),
            slots: Arc::clone(&self.slots),
        };
        let guard = slot.lock_owned().await;
        PopulationGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of keys with a holder or waiter.
    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

/// Held for the duration of one population attempt.
pub(crate) struct PopulationGuard {
    // Field order matters: the mutex guard releases its slot reference before
    // the lease checks whether the slot is still shared.
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}

struct Lease {
    key: String,
    slots: Slots,
}

impl Drop for Lease {
    fn drop(&mut self) {
        // Clones only happen under the shard lock, so a count of one here
        // means nobody else holds or waits on the slot.
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
