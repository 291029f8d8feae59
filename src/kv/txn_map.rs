/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A mutable mapping view over one [`super::KvStore`] transaction.
//!
//! Grounded on `jacquard/storage/utils.py::TransactionMap`, with one
//! behavioral fix: the reference reads that previously hit cache (most
//! notably a value that was just written in this same transaction) by
//! re-running the JSON decoder against the already-decoded cache entry.
//! The cache here holds decoded values and a hit returns them directly.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{JacquardError, Result};
use super::KvStore;

enum CacheEntry {
    Missing,
    Present(Value),
}

pub struct TransactionMap<'s, S: KvStore + ?Sized> {
    store: &'s S,
    store_keys: Option<Vec<String>>,
    pub(crate) changes: BTreeMap<String, String>,
    pub(crate) deletions: BTreeSet<String>,
    cache: std::collections::HashMap<String, CacheEntry>,
}

impl<'s, S: KvStore + ?Sized> TransactionMap<'s, S> {
    pub fn new(store: &'s S) -> Self {
        TransactionMap {
            store,
            store_keys: None,
            changes: BTreeMap::new(),
            deletions: BTreeSet::new(),
            cache: std::collections::HashMap::new(),
        }
    }

    fn encoded(&self, key: &str) -> Result<String> {
        self.store.encode_key(key)
    }

    /// Fetch and decode a value, returning [`JacquardError::NotFound`] if
    /// the key has no value in this transaction.
    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> Result<T> {
        match self.get_opt(key)? {
            Some(v) => Ok(v),
            None => Err(JacquardError::NotFound(key.to_owned())),
        }
    }

    /// Like [`Self::get`], but `None` instead of an error when absent.
    pub fn get_opt<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>> {
        if let Some(entry) = self.cache.get(key) {
            return match entry {
                CacheEntry::Missing => Ok(None),
                CacheEntry::Present(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            };
        }

        let encoded = self.encoded(key)?;
        let raw = self.store.get(&encoded)?;

        match raw {
            None => {
                self.cache.insert(key.to_owned(), CacheEntry::Missing);
                Ok(None)
            }
            Some(bytes) => {
                let value: Value = serde_json::from_str(&bytes)?;
                self.cache
                    .insert(key.to_owned(), CacheEntry::Present(value.clone()));
                Ok(Some(serde_json::from_value(value)?))
            }
        }
    }

    /// Fetch with a default applied when the key is absent.
    pub fn get_or<T: DeserializeOwned>(&mut self, key: &str, default: T) -> Result<T> {
        Ok(self.get_opt(key)?.unwrap_or(default))
    }

    /// Stage a write. Replaces any pending deletion for the same key.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let encoded = self.encoded(key)?;
        let json = serde_json::to_value(value)?;
        self.changes.insert(encoded.clone(), serde_json::to_string(&json)?);
        self.deletions.remove(&encoded);
        self.cache.insert(key.to_owned(), CacheEntry::Present(json));
        Ok(())
    }

    /// Stage a delete. Per spec, deleting a key with no current value
    /// (neither in storage nor pending in this transaction) is an error.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if self.get_opt::<Value>(key)?.is_none() {
            return Err(JacquardError::NotFound(key.to_owned()));
        }

        let encoded = self.encoded(key)?;
        self.changes.remove(&encoded);
        self.deletions.insert(encoded);
        self.cache.insert(key.to_owned(), CacheEntry::Missing);
        Ok(())
    }

    /// All logical keys visible in this transaction: store keys minus
    /// pending deletions, plus pending writes, decoded and sorted.
    pub fn keys(&mut self) -> Result<Vec<String>> {
        if self.store_keys.is_none() {
            self.store_keys = Some(self.store.keys()?);
        }

        let store_keys = self.store_keys.as_ref().unwrap();
        let mut current: BTreeSet<String> = store_keys
            .iter()
            .filter(|k| !self.deletions.contains(*k))
            .cloned()
            .collect();
        current.extend(self.changes.keys().cloned());

        let mut decoded = Vec::with_capacity(current.len());
        for k in current {
            decoded.push(self.store.decode_key(&k)?);
        }
        decoded.sort();
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryStore;

    #[test]
    fn duplicate_accesses_continue_to_raise_not_found() {
        let store = MemoryStore::new();
        let mut map = TransactionMap::new(&store);

        assert!(matches!(
            map.get::<String>("test"),
            Err(JacquardError::NotFound(_))
        ));
        assert!(matches!(
            map.get::<String>("test"),
            Err(JacquardError::NotFound(_))
        ));
    }

    #[test]
    fn read_after_write_in_same_transaction_sees_write() {
        let store = MemoryStore::new();
        let mut map = TransactionMap::new(&store);

        map.set("foo", &"bar".to_owned()).unwrap();
        let value: String = map.get("foo").unwrap();
        assert_eq!(value, "bar");
    }

    #[test]
    fn delete_of_absent_key_is_an_error() {
        let store = MemoryStore::new();
        let mut map = TransactionMap::new(&store);
        assert!(map.delete("nope").is_err());
    }
}
