//! Dependency index.
//!
//! Maps dependency tags to the cache keys whose validity depends on them, and
//! keeps the reverse direction so a key evicted on its own can be dropped from
//! every tag it was recorded under. Storage stays the source of truth; this is
//! a derived index only.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::lock::{read_guard, write_guard};

const SOURCE: &str = "cache::registry";

#[derive(Default)]
struct IndexState {
    /// tag -> keys recorded under it
    tag_to_keys: HashMap<String, HashSet<String>>,
    /// key -> tags it was recorded under
    key_to_tags: HashMap<String, HashSet<String>>,
}

/// Bidirectional tag/key index guarded by a single lock.
#[derive(Default)]
pub struct DependencyIndex {
    state: RwLock<IndexState>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` depends on `tag`. Recording the same pair twice is a
    /// no-op.
    pub fn record(&self, tag: &str, key: &str) {
        let mut state = write_guard(&self.state, SOURCE, "record");
        state
            .tag_to_keys
            .entry(tag.to_string())
            .or_default()
            .insert(key.to_string());
        state
            .key_to_tags
            .entry(key.to_string())
            .or_default()
            .insert(tag.to_string());
    }

    /// Remove `tag` and return every key recorded under it.
    ///
    /// Evicting an unknown tag returns an empty set.
    pub fn evict(&self, tag: &str) -> HashSet<String> {
        let mut state = write_guard(&self.state, SOURCE, "evict");
        let keys = state.tag_to_keys.remove(tag).unwrap_or_default();

        for key in &keys {
            if let Some(tags) = state.key_to_tags.get_mut(key) {
                tags.remove(tag);
                if tags.is_empty() {
                    state.key_to_tags.remove(key);
                }
            }
        }

        keys
    }

    /// Drop `key` from every tag it was recorded under.
    pub fn forget(&self, key: &str) {
        let mut state = write_guard(&self.state, SOURCE, "forget");
        let Some(tags) = state.key_to_tags.remove(key) else {
            return;
        };

        for tag in tags {
            if let Some(keys) = state.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    state.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    /// Keys currently recorded under `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        read_guard(&self.state, SOURCE, "keys_for_tag")
            .tag_to_keys
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// Tags `key` is currently recorded under.
    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        read_guard(&self.state, SOURCE, "tags_for_key")
            .key_to_tags
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of tags with at least one recorded key.
    pub fn tag_count(&self) -> usize {
        read_guard(&self.state, SOURCE, "tag_count").tag_to_keys.len()
    }

    /// Number of keys recorded under at least one tag.
    pub fn key_count(&self) -> usize {
        read_guard(&self.state, SOURCE, "key_count").key_to_tags.len()
    }

    pub fn clear(&self) {
        let mut state = write_guard(&self.state, SOURCE, "clear");
        state.tag_to_keys.clear();
        state.key_to_tags.clear();
    }
}
