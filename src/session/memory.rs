//! Process-local fallback cache with TTL semantics.
//!
//! Stands in for the shared Redis backend while it is degraded: string
//! values, member sets, and counters under the same key schema, with
//! per-entry expiry and a max-size bound (oldest entry evicted).
//! Guarded by a plain mutex; it is hit by many request-handling tasks
//! concurrently and every operation is short.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    created_at: Instant,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

pub struct MemoryCache {
    data: Mutex<HashMap<String, Entry>>,
    default_ttl: Duration,
    max_size: usize,
}

impl MemoryCache {
    pub fn new(default_ttl: Duration, max_size: usize) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            default_ttl,
            max_size,
        }
    }

    /// Store a string value. `ttl = None` uses the default TTL.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut data = self.data.lock().expect("cache lock");
        Self::make_room(&mut data, self.max_size, now);
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
                created_at: now,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut data = self.data.lock().expect("cache lock");
        match data.get(key) {
            Some(entry) if entry.expired(now) => {
                data.remove(key);
                None
            }
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn del(&self, key: &str) {
        self.data.lock().expect("cache lock").remove(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut data = self.data.lock().expect("cache lock");
        match data.get(key) {
            Some(entry) if entry.expired(now) => {
                data.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Reset an entry's TTL. Returns false if the key is absent or
    /// already expired.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut data = self.data.lock().expect("cache lock");
        match data.get_mut(key) {
            Some(entry) if entry.expired(now) => {
                data.remove(key);
                false
            }
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }
    }

    /// Increment a counter, creating it with `window` expiry on first
    /// use. Non-numeric existing values are treated as zero.
    pub fn incr(&self, key: &str, window: Duration) -> i64 {
        let now = Instant::now();
        let mut data = self.data.lock().expect("cache lock");
        let entry = data.get(key).filter(|e| !e.expired(now));
        let current = match entry {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => s.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        // First failure in a window starts the expiry clock; later ones
        // reset it, matching the Redis INCR+EXPIRE pipeline.
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(next.to_string()),
                expires_at: Some(now + window),
                created_at: now,
            },
        );
        next
    }

    pub fn sadd(&self, key: &str, member: &str) {
        let now = Instant::now();
        let mut data = self.data.lock().expect("cache lock");
        match data.get_mut(key).filter(|e| !e.expired(now)) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
            }
            _ => {
                let mut members = HashSet::new();
                members.insert(member.to_string());
                data.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(members),
                        // Index sets do not expire on their own; their
                        // members reference entries that do.
                        expires_at: None,
                        created_at: now,
                    },
                );
            }
        }
    }

    pub fn srem(&self, key: &str, member: &str) {
        let mut data = self.data.lock().expect("cache lock");
        if let Some(Entry {
            value: Value::Set(members),
            ..
        }) = data.get_mut(key)
        {
            members.remove(member);
            if members.is_empty() {
                data.remove(key);
            }
        }
    }

    pub fn smembers(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let mut data = self.data.lock().expect("cache lock");
        match data.get(key) {
            Some(entry) if entry.expired(now) => {
                data.remove(key);
                Vec::new()
            }
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => members.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn sismember(&self, key: &str, member: &str) -> bool {
        let now = Instant::now();
        let data = self.data.lock().expect("cache lock");
        match data.get(key) {
            Some(entry) if entry.expired(now) => false,
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => members.contains(member),
            _ => false,
        }
    }

    /// Snapshot all unexpired string entries under `prefix`, with their
    /// remaining TTLs. Used to reconcile fallback state into the shared
    /// backend after recovery.
    pub fn dump_prefix(&self, prefix: &str) -> Vec<(String, String, Option<Duration>)> {
        let now = Instant::now();
        let data = self.data.lock().expect("cache lock");
        data.iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.expired(now))
            .filter_map(|(key, entry)| match &entry.value {
                Value::Str(s) => Some((
                    key.clone(),
                    s.clone(),
                    entry.expires_at.map(|at| at.duration_since(now)),
                )),
                Value::Set(_) => None,
            })
            .collect()
    }

    /// Drop expired entries, then the oldest entry if still at capacity.
    fn make_room(data: &mut HashMap<String, Entry>, max_size: usize, now: Instant) {
        if max_size == 0 || data.len() < max_size {
            return;
        }
        data.retain(|_, entry| !entry.expired(now));
        if data.len() < max_size {
            return;
        }
        if let Some(oldest) = data
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(key, _)| key.clone())
        {
            data.remove(&oldest);
        }
    }
}
