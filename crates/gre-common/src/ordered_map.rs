//! Ordered map wrapper that prevents auto-vivification bugs.
//!
//! Every index in the session store is an `OrderedMap`. Besides exact lookup
//! it provides `first()` and `next(key)` so callers can walk an index in key
//! order starting anywhere, which the tunnel-key allocator relies on to find
//! gaps without scanning from the beginning.
//!
//! Like its hash-based ancestor it never creates entries implicitly:
//! - `get()` returns `Option<&V>`
//! - `insert_new()` refuses to overwrite
//! - `acquire()`/`release()` fail on a missing key instead of creating one

use std::collections::BTreeMap;
use std::ops::Bound;

use thiserror::Error;

use crate::refcount::{HasRefCount, RefCountError, Release};

/// Error type for OrderedMap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderedMapError {
    #[error("Key already present")]
    KeyExists,

    #[error("Key not found")]
    KeyNotFound,
}

/// An ordered map with exact and successor lookup in O(log n).
#[derive(Debug, Clone)]
pub struct OrderedMap<K, V> {
    inner: BTreeMap<K, V>,
}

impl<K: Ord, V> OrderedMap<K, V> {
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self {
            inner: BTreeMap::new(),
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the map contains the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns a reference to the value for the given key.
    ///
    /// **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Returns a mutable reference to the value for the given key.
    ///
    /// **This never creates entries.**
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    /// Inserts a new entry, failing if the key is already present.
    ///
    /// On failure the map is unchanged and the value is handed back.
    pub fn insert_new(&mut self, key: K, value: V) -> Result<(), (OrderedMapError, V)> {
        if self.inner.contains_key(&key) {
            return Err((OrderedMapError::KeyExists, value));
        }
        self.inner.insert(key, value);
        Ok(())
    }

    /// Inserts or replaces an entry, returning the old value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    /// Removes a key from the map.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    /// Returns the smallest entry.
    pub fn first(&self) -> Option<(&K, &V)> {
        self.inner.iter().next()
    }

    /// Returns the first entry strictly after `key`, whether or not `key`
    /// itself is present.
    pub fn next(&self, key: &K) -> Option<(&K, &V)> {
        self.inner
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
    }

    /// Iterates entries at or after `key` in key order.
    pub fn iter_from<'a>(&'a self, key: &K) -> impl Iterator<Item = (&'a K, &'a V)> + 'a
    where
        K: Clone,
    {
        self.inner
            .range((Bound::Included(key.clone()), Bound::Unbounded))
    }

    /// Clears all entries from the map.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Returns an iterator over key-value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    /// Returns an iterator over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    /// Returns an iterator over values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }

    /// Returns a mutable iterator over values.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.values_mut()
    }
}

impl<K: Ord, V: HasRefCount> OrderedMap<K, V> {
    /// Takes a reference on an existing entry. Returns true on the first one.
    pub fn acquire(&mut self, key: &K) -> Result<bool, RefCountError> {
        match self.inner.get_mut(key) {
            Some(entry) => entry.refs_mut().acquire(),
            None => Err(RefCountError::KeyNotFound),
        }
    }

    /// Drops a reference on an existing entry.
    ///
    /// The entry stays in the map; the caller decides what "last" means.
    pub fn release(&mut self, key: &K) -> Result<Release, RefCountError> {
        match self.inner.get_mut(key) {
            Some(entry) => entry.refs_mut().release(),
            None => Err(RefCountError::KeyNotFound),
        }
    }

    /// Returns the reference count for the given key.
    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.ref_count())
    }
}

impl<K: Ord, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}
