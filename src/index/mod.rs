//! In-memory deduplication index: an LRU cache of chunk metadata fronted by
//! an approximate membership filter.
//!
//! The index is rebuilt empty on every start; the metadata store stays the
//! source of truth.

use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use lru::LruCache;
use tracing::trace;

use crate::metastore::ChunkMetadata;
use crate::sync::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

mod filter;

pub use filter::MembershipFilter;

pub struct DedupIndex {
    // A cache `get` reorders recency, so every cache access takes the mutex.
    cache: Mutex<LruCache<String, ChunkMetadata>>,
    filter: RwLock<MembershipFilter>,
}

impl DedupIndex {
    /// A zero `cache_capacity` is raised to one entry.
    pub fn new(cache_capacity: usize, filter_capacity: usize) -> Self {
        let cache_capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cache_capacity)),
            filter: RwLock::new(MembershipFilter::new(filter_capacity)),
        }
    }

    /// Looks up a fingerprint, refreshing its recency and reference time on a hit.
    pub fn get(&self, fingerprint: &str) -> Option<ChunkMetadata> {
        let mut cache = lock_unpoisoned(&self.cache, "dedup.cache");
        let metadata = cache.get_mut(fingerprint)?;
        metadata.last_referenced_time = Utc::now();
        Some(metadata.clone())
    }

    pub fn put(&self, fingerprint: &str, mut metadata: ChunkMetadata) {
        metadata.last_referenced_time = Utc::now();
        let displaced =
            lock_unpoisoned(&self.cache, "dedup.cache").push(fingerprint.to_owned(), metadata);
        if let Some((evicted, _)) = displaced.filter(|(key, _)| key != fingerprint) {
            trace!(fingerprint = %evicted, "evicted from dedup cache");
        }
        write_unpoisoned(&self.filter, "dedup.filter").add(fingerprint);
    }

    /// Filter lookup only. `true` means "maybe seen", `false` means "probably not".
    pub fn might_contain(&self, fingerprint: &str) -> bool {
        read_unpoisoned(&self.filter, "dedup.filter").contains(fingerprint)
    }

    /// Removes the fingerprint, returning whether the cache held it.
    pub fn remove(&self, fingerprint: &str) -> bool {
        write_unpoisoned(&self.filter, "dedup.filter").remove(fingerprint);
        lock_unpoisoned(&self.cache, "dedup.cache").pop(fingerprint).is_some()
    }

    pub fn size(&self) -> usize {
        lock_unpoisoned(&self.cache, "dedup.cache").len()
    }

    pub fn capacity(&self) -> usize {
        lock_unpoisoned(&self.cache, "dedup.cache").cap().get()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.cache, "dedup.cache").clear();
        write_unpoisoned(&self.filter, "dedup.filter").clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn meta(fingerprint: &str) -> ChunkMetadata {
        ChunkMetadata::new(fingerprint, format!("file://dedupe-chunks/{fingerprint}"), 2048)
    }

    #[test]
    fn put_get_and_filter_hint() {
        let index = DedupIndex::new(10, 100);
        assert!(!index.might_contain("test-fingerprint"));

        index.put("test-fingerprint", meta("test-fingerprint"));
        let found = index.get("test-fingerprint").unwrap();
        assert_eq!(found.fingerprint, "test-fingerprint");
        assert_eq!(found.size, 2048);
        assert!(index.might_contain("test-fingerprint"));
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn lru_eviction_through_index() {
        let index = DedupIndex::new(3, 100);
        for key in ["k1", "k2", "k3"] {
            index.put(key, meta(key));
        }
        index.get("k1");
        index.put("k4", meta("k4"));

        assert_eq!(index.size(), 3);
        assert!(index.get("k2").is_none());
        for key in ["k1", "k3", "k4"] {
            assert!(index.get(key).is_some(), "{key} should be cached");
        }
    }

    #[test]
    fn remove_reports_cache_membership() {
        let index = DedupIndex::new(10, 100);
        index.put("fp", meta("fp"));

        assert!(index.remove("fp"));
        assert!(index.get("fp").is_none());
        assert!(!index.might_contain("fp"));
        assert!(!index.remove("fp"));
    }

    #[test]
    fn returned_metadata_is_a_copy() {
        let index = DedupIndex::new(10, 100);
        index.put("fp", meta("fp"));

        let mut copy = index.get("fp").unwrap();
        copy.storage_location = "tampered".into();
        assert_eq!(
            index.get("fp").unwrap().storage_location,
            "file://dedupe-chunks/fp"
        );
    }

    #[test]
    fn clear_resets_cache_and_filter() {
        let index = DedupIndex::new(10, 100);
        index.put("fp", meta("fp"));
        index.clear();
        assert_eq!(index.size(), 0);
        assert!(!index.might_contain("fp"));
    }

    #[test]
    fn overwrite_refreshes_without_evicting() {
        let index = DedupIndex::new(2, 100);
        index.put("k1", meta("k1"));
        index.put("k2", meta("k2"));

        let mut updated = meta("k1");
        updated.storage_location = "moved".into();
        index.put("k1", updated);
        assert_eq!(index.size(), 2);

        index.put("k3", meta("k3"));
        assert!(index.get("k2").is_none());
        assert_eq!(index.get("k1").unwrap().storage_location, "moved");
    }

    #[test]
    fn get_touches_reference_time() {
        let index = DedupIndex::new(1, 100);
        let mut stale = meta("k1");
        stale.last_referenced_time = stale.creation_time - chrono::Duration::hours(1);
        index.put("k1", stale.clone());

        let fetched = index.get("k1").unwrap();
        assert!(fetched.last_referenced_time > stale.last_referenced_time);
        assert_eq!(fetched.creation_time, stale.creation_time);
    }

    #[test]
    fn zero_capacity_keeps_one_entry() {
        let index = DedupIndex::new(0, 100);
        assert_eq!(index.capacity(), 1);
        index.put("k1", meta("k1"));
        index.put("k2", meta("k2"));
        assert_eq!(index.size(), 1);
        assert!(index.get("k2").is_some());
    }

    #[test]
    fn concurrent_access_keeps_capacity() {
        let index = Arc::new(DedupIndex::new(64, 1024));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("t{t}-{i}");
                        index.put(&key, meta(&key));
                        index.get(&key);
                        index.might_contain(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.size(), 64);
    }
}
