//! Eviction watch for in-flight populations.
//!
//! A population registers a ticket over the names it is about to write (its
//! key and its dependency tags). Evictions notify every name they remove
//! before deleting, so a population can tell afterwards that its fresh entry
//! was invalidated while it was being computed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

type Tickets = Arc<DashMap<String, Vec<Arc<AtomicBool>>>>;

#[derive(Default)]
pub(crate) struct EvictionWatch {
    tickets: Tickets,
}

impl EvictionWatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start watching `names`. The ticket stops watching when dropped.
    pub(crate) fn register<I>(&self, names: I) -> WatchTicket
    where
        I: IntoIterator<Item = String>,
    {
        let flag = Arc::new(AtomicBool::new(false));
        let mut watched: Vec<String> = Vec::new();
        for name in names {
            if watched.contains(&name) {
                continue;
            }
            self.tickets
                .entry(name.clone())
                .or_default()
                .push(Arc::clone(&flag));
            watched.push(name);
        }

        WatchTicket {
            flag,
            names: watched,
            tickets: Arc::clone(&self.tickets),
        }
    }

    /// Mark every ticket watching `name`.
    pub(crate) fn notify(&self, name: &str) {
        if let Some(flags) = self.tickets.get(name) {
            for flag in flags.iter() {
                flag.store(true, Ordering::Release);
            }
        }
    }

    /// Mark every ticket watching a name that starts with `prefix`.
    pub(crate) fn notify_prefix(&self, prefix: &str) {
        for entry in self.tickets.iter() {
            if entry.key().starts_with(prefix) {
                for flag in entry.value() {
                    flag.store(true, Ordering::Release);
                }
            }
        }
    }

    #[cfg(test)]
    fn watched_names(&self) -> usize {
        self.tickets.len()
    }
}

pub(crate) struct WatchTicket {
    flag: Arc<AtomicBool>,
    names: Vec<String>,
    tickets: Tickets,
}

impl WatchTicket {
    /// True once any watched name was evicted after registration.
    pub(crate) fn is_stale(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Drop for WatchTicket {
    fn drop(&mut self) {
        for name in self.names.drain(..) {
            if let Entry::Occupied(mut entry) = self.tickets.entry(name) {
                entry.get_mut().retain(|flag| !Arc::ptr_eq(flag, &self.flag));
                if entry.get().is_empty() {
                    entry.remove();
                }
            }
        }
    }
}
