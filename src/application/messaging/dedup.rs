//! Time-windowed record of recently seen identifiers

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Upper bound on tracked identifiers before forced eviction
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Stable identifier for `label` + `value`: SHA-256 over the label and
/// the key-sorted JSON rendering, hex encoded.
pub fn fingerprint(label: &str, value: &serde_json::Value) -> String {
    let mut canonical = String::new();
    write_canonical(&mut canonical, value);

    let mut hasher = Sha256::new();
    hasher.update(label.as_bytes());
    hasher.update(b"_");
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_canonical(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", serde_json::Value::String(key.clone()));
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        other => {
            let _ = write!(out, "{}", other);
        }
    }
}

/// Bounded dedup cache.
///
/// `seen` answers "is this the first sighting inside the window" and
/// records it. Expired entries are treated as absent on lookup and
/// dropped by `sweep`. Nothing here ever fails: a missing or expired id
/// is just a miss.
pub struct DedupCache {
    window: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            capacity: DEFAULT_CAPACITY,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns `true` the first time `id` shows up within the window
    /// (and starts its window), `false` for every repeat inside it.
    pub fn seen(&self, id: &str) -> bool {
        self.seen_at(id, Instant::now())
    }

    pub fn seen_at(&self, id: &str, now: Instant) -> bool {
        let mut entries = self.lock();

        if let Some(first_seen) = entries.get(id) {
            if now.duration_since(*first_seen) < self.window {
                return false;
            }
        } else if entries.len() >= self.capacity {
            Self::evict_expired(&mut entries, self.window, now);
            if entries.len() >= self.capacity {
                Self::evict_oldest(&mut entries);
            }
        }

        entries.insert(id.to_string(), now);
        true
    }

    /// Evicts entries older than the window, returns how many went.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        Self::evict_expired(&mut entries, self.window, now)
    }

    /// Drops one id so its next sighting counts as fresh
    pub fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict_expired(entries: &mut HashMap<String, Instant>, window: Duration, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, first_seen| now.duration_since(*first_seen) < window);
        before - entries.len()
    }

    fn evict_oldest(entries: &mut HashMap<String, Instant>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, first_seen)| **first_seen)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            entries.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_inside_window_is_suppressed() {
        let cache = DedupCache::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(cache.seen_at("evt-1", t0));
        assert!(!cache.seen_at("evt-1", t0 + Duration::from_secs(4)));
        assert!(cache.seen_at("evt-2", t0 + Duration::from_secs(4)));
    }

    #[test]
    fn repeat_after_window_is_fresh_again() {
        let cache = DedupCache::new(Duration::from_secs(5));
        let t0 = Instant::now();

        assert!(cache.seen_at("evt-1", t0));
        assert!(cache.seen_at("evt-1", t0 + Duration::from_secs(5)));
        // the second sighting restarted the window
        assert!(!cache.seen_at("evt-1", t0 + Duration::from_secs(9)));
    }

    #[test]
    fn sweep_only_drops_expired() {
        let cache = DedupCache::new(Duration::from_secs(10));
        let t0 = Instant::now();

        cache.seen_at("old", t0);
        cache.seen_at("new", t0 + Duration::from_secs(8));

        assert_eq!(cache.sweep(t0 + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.seen_at("new", t0 + Duration::from_secs(12)));
    }

    #[test]
    fn capacity_evicts_oldest_live_entry() {
        let cache = DedupCache::new(Duration::from_secs(60)).with_capacity(2);
        let t0 = Instant::now();

        cache.seen_at("a", t0);
        cache.seen_at("b", t0 + Duration::from_secs(1));
        cache.seen_at("c", t0 + Duration::from_secs(2));

        assert_eq!(cache.len(), 2);
        // "a" was evicted, so it counts as fresh
        assert!(cache.seen_at("a", t0 + Duration::from_secs(3)));
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = serde_json::json!({"group_id": 1, "message": {"text": "hi", "at": [1, 2]}});
        let b = serde_json::json!({"message": {"at": [1, 2], "text": "hi"}, "group_id": 1});
        assert_eq!(fingerprint("send_group_msg", &a), fingerprint("send_group_msg", &b));
        assert_ne!(fingerprint("send_group_msg", &a), fingerprint("send_private_msg", &a));
        assert_eq!(fingerprint("x", &a).len(), 64);
    }

    #[test]
    fn forget_makes_next_sighting_fresh() {
        let cache = DedupCache::new(Duration::from_secs(60));
        assert!(cache.seen("x"));
        cache.forget("x");
        assert!(cache.seen("x"));
    }
}
