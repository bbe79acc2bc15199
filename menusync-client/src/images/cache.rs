//! Image URL cache
//!
//! Keyed by (category, normalized dish name). Shared between sessions so a
//! dish that was matched once keeps its image when a later session of the
//! same menu has not reached the image stage yet. Entries expire after a TTL
//! and the oldest entry is evicted once capacity is reached.

use super::matcher::normalize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct CacheEntry {
    url: String,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first; holds exactly the keys of `entries`
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        let CacheInner { entries, order } = self;
        order.retain(|k| entries.contains_key(k));
        before - entries.len()
    }
}

#[derive(Debug)]
pub struct ImageUrlCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ImageUrlCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn key(category: &str, name: &str) -> String {
        format!("{}\u{1f}{}", normalize(category), normalize(name))
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // Entries are plain data, a panic elsewhere cannot leave them torn
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached url, if present and not expired
    pub fn get(&self, category: &str, name: &str) -> Option<String> {
        let key = Self::key(category, name);
        let mut inner = self.lock();
        let expired = match inner.entries.get(&key) {
            None => return None,
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };
        if expired {
            inner.remove(&key);
            return None;
        }
        inner.entries.get(&key).map(|e| e.url.clone())
    }

    pub fn insert(&self, category: &str, name: &str, url: impl Into<String>) {
        let key = Self::key(category, name);
        let mut inner = self.lock();
        inner.purge_expired(self.ttl);

        let entry = CacheEntry {
            url: url.into(),
            inserted_at: Instant::now(),
        };
        if inner.entries.insert(key.clone(), entry).is_some() {
            inner.order.retain(|k| k != &key);
        }
        inner.order.push_back(key);

        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                debug!(key = %oldest, "Evicted image url (capacity)");
            }
        }
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(self.ttl)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
