use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use priority_queue::PriorityQueue;

use dns_types::protocol::types::{CacheKey, ResourceRecord};

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] response cache mutex poisoned, cannot recover from this - aborting";

/// A thread-safe handle to a `Cache`.  Cloning gives another handle to
/// the same underlying cache, the way `SharedCache` does in the
/// upstream project.
#[derive(Debug, Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<Cache>>,
}

impl SharedCache {
    /// `capacity == 0` disables the cache: every `get` misses, and
    /// `set` is a no-op, as the response cache is documented in
    /// spec.md §4.2 and the resolver checks `is_enabled()` before
    /// bothering to look a key up.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Cache::new(capacity))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).capacity > 0
    }

    /// # Panics
    /// If the mutex has been poisoned.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<ResourceRecord>> {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).get(key)
    }

    /// # Panics
    /// If the mutex has been poisoned.
    pub fn set(&self, records: Vec<ResourceRecord>) -> Result<(), Error> {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).set(records)
    }

    /// # Panics
    /// If the mutex has been poisoned.
    pub fn delete(&self, key: &CacheKey) {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).delete(key);
    }

    /// # Panics
    /// If the mutex has been poisoned.
    pub fn len(&self) -> usize {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// # Panics
    /// If the mutex has been poisoned.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entries
            .keys()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    records: Vec<ResourceRecord>,
}

/// LRU response cache keyed by `CacheKey()`, bounded by a configured
/// capacity measured in entries (not individual records), per
/// spec.md §4.2.
///
/// Eviction order is classic LRU by last access; expired entries are
/// always pruned before an LRU eviction is considered, since an
/// expired entry is free real estate.
#[derive(Debug)]
struct Cache {
    entries: HashMap<CacheKey, Entry>,
    access_priority: PriorityQueue<CacheKey, Reverse<Instant>>,
    capacity: usize,
}

impl Cache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            access_priority: PriorityQueue::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Vec<ResourceRecord>> {
        if self.capacity == 0 {
            return None;
        }

        let now = Instant::now();
        let entry = self.entries.get_mut(key)?;

        entry.records.retain(|rr| !rr.is_expired(now));

        if entry.records.is_empty() {
            self.entries.remove(key);
            self.access_priority.remove(key);
            return None;
        }

        self.access_priority.change_priority(key, Reverse(now));
        Some(entry.records.clone())
    }

    fn set(&mut self, records: Vec<ResourceRecord>) -> Result<(), Error> {
        if self.capacity == 0 || records.is_empty() {
            return Ok(());
        }

        let key = records[0].cache_key();
        for rr in &records[1..] {
            if rr.cache_key() != key {
                return Err(Error::MultipleKeys);
            }
        }

        let now = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one();
        }

        self.entries.insert(key.clone(), Entry { records });
        self.access_priority.push(key, Reverse(now));

        Ok(())
    }

    fn delete(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.access_priority.remove(key);
    }

    fn evict_one(&mut self) {
        if let Some((key, _)) = self.access_priority.pop() {
            self.entries.remove(&key);
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// Returned by `set` when the input records do not all share the
    /// same `CacheKey()`.
    MultipleKeys,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::MultipleKeys => write!(f, "records passed to Cache::set do not share a CacheKey"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use dns_types::protocol::types::Origin;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn cached(name: &str, ttl_from_now: Duration) -> ResourceRecord {
        let mut rr = a_record(name, Ipv4Addr::new(1, 2, 3, 4));
        rr.origin = Origin::Cached;
        rr.expires_at = Some(Instant::now() + ttl_from_now);
        rr
    }

    #[test]
    fn set_then_get_hits() {
        let cache = SharedCache::new(10);
        let rr = cached("www.example.com.", Duration::from_secs(60));
        let key = rr.cache_key();

        cache.set(vec![rr.clone()]).unwrap();

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit, vec![rr]);
    }

    #[test]
    fn get_misses_on_expiry() {
        let cache = SharedCache::new(10);
        let rr = cached("www.example.com.", Duration::from_millis(0));
        let key = rr.cache_key();
        cache.set(vec![rr]).unwrap();

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_rejects_mismatched_keys() {
        let cache = SharedCache::new(10);
        let a = cached("www.example.com.", Duration::from_secs(60));
        let b = cached("other.example.com.", Duration::from_secs(60));

        assert_eq!(cache.set(vec![a, b]), Err(Error::MultipleKeys));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_with_empty_input_is_a_no_op() {
        let cache = SharedCache::new(10);
        cache.set(vec![]).unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_zero_disables_the_cache() {
        let cache = SharedCache::new(0);
        let rr = cached("www.example.com.", Duration::from_secs(60));
        let key = rr.cache_key();

        cache.set(vec![rr]).unwrap();
        assert!(!cache.is_enabled());
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn evicts_least_recently_used_when_full() {
        let cache = SharedCache::new(1);

        let first = cached("first.example.com.", Duration::from_secs(60));
        let first_key = first.cache_key();
        cache.set(vec![first]).unwrap();

        let second = cached("second.example.com.", Duration::from_secs(60));
        let second_key = second.cache_key();
        cache.set(vec![second]).unwrap();

        assert_eq!(cache.get(&first_key), None);
        assert!(cache.get(&second_key).is_some());
    }
}
