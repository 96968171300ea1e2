//! Keyed pool of shared clients with idle and lifetime bounds

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

struct PoolEntry<T> {
    value: Arc<T>,
    created: Instant,
    last_used: Instant,
}

/// Clients shared by every template rendered for the same node.
///
/// One coarse lock guards the map. Entries idle longer than `max_idle` or
/// older than `max_lifetime` are dropped on the next [`ClientPool::get`].
pub struct ClientPool<T> {
    entries: Mutex<HashMap<String, PoolEntry<T>>>,
    max_idle: Duration,
    max_lifetime: Duration,
}

impl<T> ClientPool<T> {
    pub fn new(max_idle: Duration, max_lifetime: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_idle,
            max_lifetime,
        }
    }

    /// Shared client for `key`, created with `make` when absent or expired.
    pub fn get(&self, key: &str, make: impl FnOnce() -> T) -> Arc<T> {
        self.get_at(key, Instant::now(), make)
    }

    fn get_at(&self, key: &str, now: Instant, make: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let (max_idle, max_lifetime) = (self.max_idle, self.max_lifetime);
        entries.retain(|k, entry| {
            let alive = now.saturating_duration_since(entry.last_used) <= max_idle
                && now.saturating_duration_since(entry.created) <= max_lifetime;
            if !alive {
                debug!(key = %k, "dropping expired pooled client");
            }
            alive
        });

        let entry = entries.entry(key.to_string()).or_insert_with(|| PoolEntry {
            value: Arc::new(make()),
            created: now,
            last_used: now,
        });
        entry.last_used = now;
        entry.value.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
