//! Bounded TTL cache for analysis results
//!
//! Entries expire after a fixed time-to-live. At capacity the oldest
//! inserted entry is evicted, whether or not it has expired.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

struct Entry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

pub struct ResultCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Fresh value for `key`; expired entries are dropped on lookup
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if now - entry.inserted_at < self.ttl => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V, now: DateTime<Utc>) {
        let key = key.into();
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| *k != key);
        } else {
            while inner.entries.len() >= self.capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

impl<V> std::fmt::Debug for ResultCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}
