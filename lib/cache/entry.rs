//! Per-archive cache of small decompressed entries.
//!
//! Entries are keyed by name, CRC-32 and the archive's modification time, so a rewritten archive
//! never serves stale content even if an entry keeps its name. The cache is bounded three ways:
//! by entry count, by total bytes, and by a per-entry size limit above which content is never
//! cached. Eviction is least-recently-used.

use std::time::SystemTime;

use bytes::Bytes;
use hashlink::LinkedHashMap;

/// Identity of cached entry content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    /// Entry name within the archive.
    pub name: String,
    /// CRC-32 of the uncompressed content.
    pub crc32: u32,
    /// Modification time of the archive the content was read from.
    pub modified: Option<SystemTime>,
}

/// Hit and miss counters of an [`EntryCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to read the archive.
    pub misses: u64,
    /// Entries currently cached.
    pub entries: usize,
    /// Bytes currently cached.
    pub bytes: u64,
}

/// LRU cache of entry content with count, byte and per-entry bounds.
#[derive(Debug)]
pub struct EntryCache {
    map: LinkedHashMap<EntryKey, Bytes>,
    max_entries: usize,
    max_bytes: u64,
    entry_limit: u64,
    bytes: u64,
    hits: u64,
    misses: u64,
}

impl EntryCache {
    /// Create a cache. `max_entries == 0` disables caching entirely.
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: u64, entry_limit: u64) -> Self {
        Self {
            map: LinkedHashMap::new(),
            max_entries,
            max_bytes,
            entry_limit,
            bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Whether content of `size` bytes is eligible for caching.
    #[must_use]
    pub fn admits(&self, size: u64) -> bool {
        self.max_entries > 0 && size <= self.entry_limit && size <= self.max_bytes
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &EntryKey) -> Option<Bytes> {
        if let Some(content) = self.map.to_back(key) {
            self.hits += 1;
            return Some(content.clone());
        }
        self.misses += 1;
        None
    }

    /// Cache `content` under `key`, evicting least recently used entries to make room.
    ///
    /// Content the cache does not [`admit`](Self::admits) is ignored.
    pub fn insert(&mut self, key: EntryKey, content: Bytes) {
        let size = content.len() as u64;
        if !self.admits(size) {
            return;
        }
        if let Some(previous) = self.map.remove(&key) {
            self.bytes -= previous.len() as u64;
        }
        while self.map.len() >= self.max_entries || self.bytes + size > self.max_bytes {
            let Some((_, evicted)) = self.map.pop_front() else {
                break;
            };
            self.bytes -= evicted.len() as u64;
        }
        self.bytes += size;
        self.map.insert(key, content);
    }

    /// Drop every cached entry. Counters are kept.
    pub fn clear(&mut self) {
        self.map.clear();
        self.bytes = 0;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> EntryCacheStats {
        EntryCacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.map.len(),
            bytes: self.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> EntryKey {
        EntryKey {
            name: name.to_owned(),
            crc32: 0,
            modified: None,
        }
    }

    #[test]
    fn hit_refreshes_recency() {
        let mut cache = EntryCache::new(2, 1024, 1024);
        cache.insert(key("a"), Bytes::from_static(b"a"));
        cache.insert(key("b"), Bytes::from_static(b"b"));

        assert!(cache.get(&key("a")).is_some());
        cache.insert(key("c"), Bytes::from_static(b"c"));

        assert!(cache.get(&key("b")).is_none(), "b was least recently used");
        assert!(cache.get(&key("a")).is_some());
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn byte_budget_evicts_oldest() {
        let mut cache = EntryCache::new(16, 10, 8);
        cache.insert(key("a"), Bytes::from(vec![0; 6]));
        cache.insert(key("b"), Bytes::from(vec![0; 6]));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.bytes, 6);
        assert!(cache.get(&key("b")).is_some());
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let mut cache = EntryCache::new(16, 1024, 4);
        cache.insert(key("big"), Bytes::from(vec![0; 5]));
        assert!(cache.get(&key("big")).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn modification_time_is_part_of_the_key() {
        let mut cache = EntryCache::new(16, 1024, 1024);
        cache.insert(key("a"), Bytes::from_static(b"old"));

        let rewritten = EntryKey {
            modified: Some(SystemTime::UNIX_EPOCH),
            ..key("a")
        };
        assert!(cache.get(&rewritten).is_none());
    }
}
