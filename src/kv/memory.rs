/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The in-memory backend. No persistence, no real concurrency conflicts;
//! exists for tests and for embedding this crate in a process that does
//! not need durability. Grounded on `jacquard/storage/dummy.py`.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::Result;
use super::KvStore;

pub struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn seeded(initial: BTreeMap<String, String>) -> Self {
        MemoryStore {
            data: Mutex::new(initial),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(
        &self,
        changes: &std::collections::BTreeMap<String, String>,
        deletions: &std::collections::BTreeSet<String>,
    ) -> Result<()> {
        let mut data = self.data.lock();
        for key in deletions {
            data.remove(key);
        }
        for (key, value) in changes {
            data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.lock().keys().cloned().collect())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::transaction;

    #[test]
    fn roundtrips_a_value() {
        let store = MemoryStore::new();
        transaction(&store, false, |map| {
            map.set("foo", &"bar".to_owned())?;
            Ok(())
        })
        .unwrap();

        let value: String = transaction(&store, true, |map| map.get("foo")).unwrap();
        assert_eq!(value, "bar");
    }

    #[test]
    fn no_writes_means_no_commit_needed() {
        let store = MemoryStore::new();
        transaction(&store, false, |map| {
            let _ = map.get_opt::<String>("missing")?;
            Ok(())
        })
        .unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
