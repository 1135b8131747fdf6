//! # Record Store
//!
//! In-memory record storage for a node: a hash map behind a read/write lock
//! with TTL checked on access.

use std::convert::Infallible;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use ckv_common::{Bins, Record, RecordMeta};

#[derive(Debug)]
struct Entry {
    bins: Bins,
    generation: u32,
    // Absolute expiration timestamp.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    fn ttl_secs(&self, now: Instant) -> u32 {
        match self.expires_at {
            Some(deadline) => deadline
                .saturating_duration_since(now)
                .as_secs()
                .clamp(1, u32::MAX as u64) as u32,
            None => 0,
        }
    }

    fn to_record(&self, now: Instant) -> Record {
        Record {
            bins: self.bins.clone(),
            generation: self.generation,
            ttl: self.ttl_secs(now),
        }
    }
}

/// Key bytes to record, keyed by `Key::wire_bytes()`.
#[derive(Debug)]
pub struct Store {
    map: RwLock<HashMap<Vec<u8>, Entry, RandomState>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store {
            map: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Returns the live record, or `None` when missing or expired.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        let now = Instant::now();
        {
            let map = self.map.read();
            match map.get(key) {
                Some(entry) if !entry.is_expired(now) => return Some(entry.to_record(now)),
                Some(_) => {}
                None => return None,
            }
        }
        self.remove_expired(key, now);
        None
    }

    /// Drops the entry only if it is still expired under the write lock.
    fn remove_expired(&self, key: &[u8], now: Instant) {
        let mut map = self.map.write();
        if map.get(key).is_some_and(|entry| entry.is_expired(now)) {
            map.remove(key);
        }
    }

    pub fn meta(&self, key: &[u8]) -> Option<RecordMeta> {
        self.get(key).map(|record| record.meta())
    }

    /// Merges bins into the record and bumps its generation.
    ///
    /// A `ttl` of zero keeps the record forever. Returns the new generation.
    pub fn put(&self, key: &[u8], bins: Bins, ttl: u32) -> u32 {
        self.put_if(key, bins, ttl, |_| Ok::<(), Infallible>(()))
            .unwrap_or_else(|never| match never {})
    }

    /// Like [`Store::put`], but first runs `guard` on the live record's bins
    /// under the same write lock. A missing record always passes.
    pub fn put_if<E>(
        &self,
        key: &[u8],
        bins: Bins,
        ttl: u32,
        guard: impl FnOnce(&Bins) -> Result<(), E>,
    ) -> Result<u32, E> {
        let now = Instant::now();
        let expires_at = (ttl > 0).then(|| now + Duration::from_secs(ttl as u64));
        let mut map = self.map.write();
        match map.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                guard(&entry.bins)?;
                entry.bins.extend(bins);
                entry.generation = entry.generation.wrapping_add(1);
                entry.expires_at = expires_at;
                Ok(entry.generation)
            }
            _ => {
                map.insert(
                    key.to_vec(),
                    Entry {
                        bins,
                        generation: 1,
                        expires_at,
                    },
                );
                Ok(1)
            }
        }
    }

    /// Removes a record. Returns true when a live record was removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.delete_if(key, |_| Ok::<(), Infallible>(()))
            .unwrap_or_else(|never| match never {})
    }

    /// Removes a record if `guard` accepts its bins, checked under the write
    /// lock. Returns `Ok(true)` when a live record was removed.
    pub fn delete_if<E>(
        &self,
        key: &[u8],
        guard: impl FnOnce(&Bins) -> Result<(), E>,
    ) -> Result<bool, E> {
        let now = Instant::now();
        let mut map = self.map.write();
        match map.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                guard(&entry.bins)?;
                map.remove(key);
                Ok(true)
            }
            Some(_) => {
                map.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bins(name: &str, value: serde_json::Value) -> Bins {
        let mut bins = Bins::new();
        bins.insert(name.to_string(), value);
        bins
    }

    #[test]
    fn put_merges_and_bumps_generation() {
        let store = Store::new();
        assert_eq!(store.put(b"k", bins("a", json!(1)), 0), 1);
        assert_eq!(store.put(b"k", bins("b", json!(2)), 0), 2);

        let record = store.get(b"k").unwrap();
        assert_eq!(record.generation, 2);
        assert_eq!(record.ttl, 0);
        assert_eq!(record.bins.len(), 2);
    }

    #[test]
    fn ttl_is_reported_in_seconds() {
        let store = Store::new();
        store.put(b"k", bins("a", json!(1)), 60);
        let meta = store.meta(b"k").unwrap();
        assert!(meta.ttl > 0 && meta.ttl <= 60);
    }

    #[test]
    fn delete_reports_removal() {
        let store = Store::new();
        store.put(b"k", bins("a", json!(1)), 0);
        assert!(store.delete(b"k"));
        assert!(!store.delete(b"k"));
        assert!(store.get(b"k").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn expiry_cleanup_spares_a_fresh_record() {
        let store = Store::new();
        let stale = Instant::now();
        store.map.write().insert(
            b"k".to_vec(),
            Entry {
                bins: bins("old", json!(true)),
                generation: 7,
                expires_at: Some(stale),
            },
        );

        // A writer replaces the expired entry before the reader's cleanup runs.
        assert_eq!(store.put(b"k", bins("new", json!(true)), 0), 1);
        store.remove_expired(b"k", stale);

        let record = store.get(b"k").unwrap();
        assert_eq!(record.generation, 1);
        assert!(record.bins.contains_key("new"));
    }

    #[test]
    fn guarded_writes_leave_rejected_records_untouched() {
        let store = Store::new();
        store.put(b"k", bins("a", json!(1)), 0);

        let rejected = store.put_if(b"k", bins("a", json!(2)), 0, |_| Err("no"));
        assert_eq!(rejected, Err("no"));
        assert_eq!(store.delete_if(b"k", |_| Err("no")), Err("no"));
        let record = store.get(b"k").unwrap();
        assert_eq!(record.generation, 1);
        assert_eq!(record.bins["a"], json!(1));

        let accepted = store.put_if(b"k", bins("a", json!(2)), 0, |bins| {
            if bins["a"] == json!(1) {
                Ok(())
            } else {
                Err("no")
            }
        });
        assert_eq!(accepted, Ok(2));
        assert_eq!(store.delete_if(b"k", |_| Ok::<(), &str>(())), Ok(true));
        assert_eq!(store.put_if(b"gone", bins("a", json!(1)), 0, |_| Err("no")), Ok(1));
    }
}
