/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The transactional key-value store abstraction.
//!
//! `KvStore` is the capability every backend (in-memory, SQLite, Redis,
//! cloned-Redis, etcd) implements. Backends speak in raw bytes and encoded
//! keys; [`txn_map::TransactionMap`] layers a mutable, JSON-codec, write-
//! through cache on top for callers.

pub mod memory;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;
#[cfg(feature = "redis-backend")]
pub mod redis_store;
#[cfg(feature = "cloned-redis-backend")]
pub mod cloned_redis;
#[cfg(feature = "etcd-backend")]
pub mod etcd_store;
pub mod txn_map;

use crate::error::{JacquardError, Result};
pub use txn_map::TransactionMap;

/// A single logical unit of work against the store.
///
/// Implementors must guarantee: a commit attempted on a read-only
/// transaction is refused with an error naming the touched keys, and
/// commits never leave the backend in a state where `Retry` was returned
/// but the write partially landed.
pub trait KvStore: Send + Sync {
    /// Begin a read-write transaction.
    fn begin(&self) -> Result<()>;

    /// Begin a read-only transaction. Implementations that cannot tell the
    /// two modes apart may treat this the same as `begin`, but must still
    /// honor the read-only commit refusal.
    fn begin_read_only(&self) -> Result<()> {
        self.begin()
    }

    /// Commit staged `changes` (encoded key -> JSON bytes) and `deletions`
    /// (encoded keys). Returns [`JacquardError::Retry`] on an optimistic
    /// concurrency conflict.
    fn commit(&self, changes: &std::collections::BTreeMap<String, String>, deletions: &std::collections::BTreeSet<String>) -> Result<()>;

    /// Abandon the current transaction without applying any writes.
    fn rollback(&self) -> Result<()>;

    /// All encoded keys currently visible to this transaction.
    fn keys(&self) -> Result<Vec<String>>;

    /// The raw value for an encoded key, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Transform a logical key into backend storage form. Default is the
    /// identity transform; Redis-family backends rewrite slashes to colons
    /// under a fixed prefix.
    fn encode_key(&self, key: &str) -> Result<String> {
        Ok(key.to_owned())
    }

    /// Inverse of [`KvStore::encode_key`].
    fn decode_key(&self, key: &str) -> Result<String> {
        Ok(key.to_owned())
    }
}

/// Open a scoped transaction, run `body` with a [`TransactionMap`], and
/// commit or roll back according to spec: a clean exit with no writes
/// rolls back (no empty commits); a clean exit with writes commits; any
/// error rolls back and propagates.
pub fn transaction<S, F, T>(store: &S, read_only: bool, body: F) -> Result<T>
where
    S: KvStore + ?Sized,
    F: FnOnce(&mut TransactionMap<'_, S>) -> Result<T>,
{
    if read_only {
        store.begin_read_only()?;
    } else {
        store.begin()?;
    }

    let mut map = TransactionMap::new(store);

    let result = match body(&mut map) {
        Ok(value) => value,
        Err(e) => {
            store.rollback()?;
            return Err(e);
        }
    };

    if map.changes.is_empty() && map.deletions.is_empty() {
        store.rollback()?;
        return Ok(result);
    }

    if read_only {
        let touched: Vec<String> = map
            .changes
            .keys()
            .chain(map.deletions.iter())
            .cloned()
            .collect();
        store.rollback()?;
        return Err(JacquardError::ReadOnlyCommit(touched));
    }

    store.commit(&map.changes, &map.deletions)?;
    Ok(result)
}
