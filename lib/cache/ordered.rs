//! Insertion-ordered store with bounded insertion.
//!
//! [`OrderedStore`] is a hash map whose entries keep the order in which they were added. It is
//! the one container behind the reaper's quick-pending queue, slow-pending queue and completed
//! registry: the queues rely on the order to find the ripest entry, and the registry relies on
//! bounded insertion to forget the oldest fully-closed records.
//!
//! No eviction policy is decided here. [`OrderedStore::push_back_bounded`] only evicts what the
//! caller's capacity forces out, and hands the evicted entry back.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;

use hashlink::LinkedHashMap;
use thiserror::Error;

/// Structural misuse of an [`OrderedStore`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A value was added under a key that is already present.
    #[error("key {key} is already present in the ordered store")]
    DuplicateKey {
        /// Debug rendering of the offending key.
        key: String,
    },
}

/// Upper bound on the number of entries of an [`OrderedStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Never evict.
    Unbounded,
    /// Evict the oldest entries beyond this many.
    Bounded(NonZeroUsize),
}

impl Capacity {
    /// Interpret a configured limit, where `-1` means unbounded.
    ///
    /// Returns `None` for zero and for negative values other than `-1`.
    #[must_use]
    pub fn from_limit(limit: i64) -> Option<Self> {
        match limit {
            -1 => Some(Self::Unbounded),
            n if n > 0 => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(Self::Bounded),
            _ => None,
        }
    }

    fn admits(self, len: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Bounded(max) => len <= max.get(),
        }
    }
}

/// An insertion-ordered map with O(1) lookup, removal, and first/last access.
#[derive(Debug)]
pub struct OrderedStore<K, V> {
    map: LinkedHashMap<K, V>,
}

impl<K, V> Default for OrderedStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            map: LinkedHashMap::new(),
        }
    }
}

impl<K, V> OrderedStore<K, V>
where
    K: Eq + Hash + Debug,
{
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Look up the value stored under `key` for mutation. Does not change the order.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Remove the entry for `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    fn reject_duplicate(&self, key: &K) -> Result<(), StoreError> {
        if self.map.contains_key(key) {
            return Err(StoreError::DuplicateKey {
                key: format!("{key:?}"),
            });
        }
        Ok(())
    }

    /// Add an entry as the newest one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] if `key` is already present.
    pub fn push_back(&mut self, key: K, value: V) -> Result<(), StoreError> {
        self.reject_duplicate(&key)?;
        self.map.insert(key, value);
        Ok(())
    }

    /// Add an entry as the oldest one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] if `key` is already present.
    pub fn push_front(&mut self, key: K, value: V) -> Result<(), StoreError>
    where
        K: Clone,
    {
        self.reject_duplicate(&key)?;
        self.map.insert(key.clone(), value);
        self.map.to_front(&key);
        Ok(())
    }

    /// Add an entry as the newest one, evicting the oldest entry if the store would otherwise
    /// exceed `capacity`.
    ///
    /// Returns the evicted entry, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateKey`] if `key` is already present; nothing is evicted in
    /// that case.
    pub fn push_back_bounded(
        &mut self,
        key: K,
        value: V,
        capacity: Capacity,
    ) -> Result<Option<(K, V)>, StoreError> {
        self.reject_duplicate(&key)?;
        let evicted = if capacity.admits(self.map.len() + 1) {
            None
        } else {
            self.map.pop_front()
        };
        self.map.insert(key, value);
        Ok(evicted)
    }

    /// The oldest entry.
    #[must_use]
    pub fn first(&self) -> Option<(&K, &V)> {
        self.map.front()
    }

    /// The newest entry.
    #[must_use]
    pub fn last(&self) -> Option<(&K, &V)> {
        self.map.back()
    }

    /// Remove and return the oldest entry.
    pub fn pop_front(&mut self) -> Option<(K, V)> {
        self.map.pop_front()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    /// Keep only the entries for which `keep` returns `true`, preserving order.
    ///
    /// This is the supported way to remove entries while walking the store.
    pub fn retain(&mut self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.map.retain(keep);
    }

    /// Remove every entry, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        std::iter::from_fn(move || self.map.pop_front())
    }
}
