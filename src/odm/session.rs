/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The identity-mapped session that sits between typed [`Model`]s and a
//! [`TransactionMap`]. Grounded on the session/model split in
//! `jacquard/odm/`, generalised to the richer field set `buckets/models.py`
//! already assumes (see module docs on [`super::fields`]).

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::error::{JacquardError, Result};
use crate::kv::{KvStore, TransactionMap};

/// A record with a storage identity, typed fields, and forward-compat
/// upgrade of its raw on-disk shape.
pub trait Model: Sized {
    /// The key prefix records of this type are stored under, e.g.
    /// `"buckets"` for `Bucket` — one path segment, already pluralised.
    fn storage_name() -> &'static str;

    fn pk(&self) -> String;

    /// Decode a loaded instance from its primary key and raw field map.
    fn from_raw(pk: String, raw: Map<String, Value>) -> Result<Self>;

    /// Encode this instance's fields back to their raw storage form.
    fn to_raw(&self) -> Result<Map<String, Value>>;

    /// A fresh, empty instance for a primary key with no stored record.
    fn empty(pk: String) -> Self;

    /// Field-level validation run on flush. Defaults to accepting
    /// anything; models with required invariants override this.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// The sole forward-compatibility seam: upgrades a raw value read
    /// from storage, in whatever shape an older writer may have left it,
    /// into the shape `from_raw` expects. Identity by default.
    fn transitional_upgrade_raw_data(raw: Value) -> Value {
        raw
    }
}

fn storage_key(model_name: &str, pk: &str) -> String {
    format!("{model_name}/{pk}")
}

/// What to do when [`Session::get`] finds no stored record for a key.
pub enum GetDefault<M> {
    /// Surface `JacquardError::NotFound`.
    Raise,
    /// Hand back `M::empty(pk)` without attaching it to the session.
    EmptyInstance,
    /// Create `M::empty(pk)`, attach it via `add`, and return it.
    CreateAndAdd,
    /// Hand back a caller-supplied value without attaching it.
    Value(M),
}

/// An identity-mapped, dirty-tracking view over one model type for the
/// lifetime of a transaction.
pub struct Session<'a, 's, S: KvStore + ?Sized, M: Model> {
    map: &'a mut TransactionMap<'s, S>,
    identity: HashMap<String, M>,
    dirty: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl<'a, 's, S: KvStore + ?Sized, M: Model + Clone> Session<'a, 's, S, M> {
    pub fn new(map: &'a mut TransactionMap<'s, S>) -> Self {
        Session {
            map,
            identity: HashMap::new(),
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Escape hatch onto the underlying transaction map, for callers that
    /// need to read or write keys outside this session's model type (the
    /// process-level lists, for instance) inside the same transaction.
    pub fn raw(&mut self) -> &mut TransactionMap<'s, S> {
        self.map
    }

    /// Identity-mapped fetch: repeated calls for the same `pk` within one
    /// session return the same logical instance without re-reading
    /// storage.
    pub fn get(&mut self, pk: &str, default: GetDefault<M>) -> Result<M> {
        if let Some(existing) = self.identity.get(pk) {
            return Ok(existing.clone());
        }

        let key = storage_key(M::storage_name(), pk);
        let raw_value = self.map.get_opt::<Value>(&key)?;

        match raw_value {
            Some(value) => {
                let upgraded = M::transitional_upgrade_raw_data(value);
                let fields = match upgraded {
                    Value::Object(m) => m,
                    other => {
                        return Err(JacquardError::ValidationError(format!(
                            "record {key:?}: expected an object, got {other:?}"
                        )))
                    }
                };
                let instance = M::from_raw(pk.to_owned(), fields)?;
                self.identity.insert(pk.to_owned(), instance.clone());
                Ok(instance)
            }
            None => match default {
                GetDefault::Raise => Err(JacquardError::NotFound(key)),
                GetDefault::EmptyInstance => Ok(M::empty(pk.to_owned())),
                GetDefault::CreateAndAdd => {
                    let instance = M::empty(pk.to_owned());
                    self.add(instance.clone())?;
                    Ok(instance)
                }
                GetDefault::Value(v) => Ok(v),
            },
        }
    }

    /// Attach a fresh instance. Errors if a different instance with the
    /// same primary key is already attached to this session.
    pub fn add(&mut self, instance: M) -> Result<()> {
        let pk = instance.pk();
        if self.identity.contains_key(&pk) {
            return Err(JacquardError::ProgrammerError(
                "instance already attached to this session",
            ));
        }
        self.removed.remove(&pk);
        self.dirty.insert(pk.clone());
        self.identity.insert(pk, instance);
        Ok(())
    }

    /// Detach an instance and mark its primary key for deletion on flush.
    pub fn remove(&mut self, instance: &M) {
        let pk = instance.pk();
        self.identity.remove(&pk);
        self.dirty.remove(&pk);
        self.removed.insert(pk);
    }

    /// Save `instance`'s current field values back into the session and
    /// force a write for its primary key on the next flush. Since `get`
    /// hands back an owned copy, this is how a caller's mutations to that
    /// copy make it back into the session.
    pub fn mark_instance_dirty(&mut self, instance: &M) {
        let pk = instance.pk();
        self.removed.remove(&pk);
        self.identity.insert(pk.clone(), instance.clone());
        self.dirty.insert(pk);
    }

    /// Validate and write every dirty instance, and delete every removed
    /// primary key (silently, if it was never actually stored).
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<String> = self.dirty.iter().cloned().collect();
        self.dirty.clear();

        for pk in dirty {
            let instance = self
                .identity
                .get(&pk)
                .ok_or(JacquardError::ProgrammerError(
                    "dirty primary key with no attached instance",
                ))?;
            instance.validate()?;
            let raw = instance.to_raw()?;
            let key = storage_key(M::storage_name(), &pk);
            self.map.set(&key, &Value::Object(raw))?;
        }

        let removed: Vec<String> = self.removed.iter().cloned().collect();
        self.removed.clear();

        for pk in removed {
            let key = storage_key(M::storage_name(), &pk);
            match self.map.delete(&key) {
                Ok(()) => {}
                Err(JacquardError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Open a backend transaction, construct a session over it, run `body`,
/// then flush and commit on a clean exit or roll back (without flushing)
/// on error.
pub fn transaction<S, M, F, T>(store: &S, body: F) -> Result<T>
where
    S: KvStore + ?Sized,
    M: Model + Clone,
    F: FnOnce(&mut Session<'_, '_, S, M>) -> Result<T>,
{
    transaction_with_mode(store, false, body)
}

/// Like [`transaction`], but opens a read-only backend transaction. A
/// `body` that tries to flush a dirty or removed instance surfaces
/// [`JacquardError::ReadOnlyCommit`] naming the touched keys, same as the
/// raw [`super::super::kv::transaction`] does for plain map writes.
pub fn read_only_transaction<S, M, F, T>(store: &S, body: F) -> Result<T>
where
    S: KvStore + ?Sized,
    M: Model + Clone,
    F: FnOnce(&mut Session<'_, '_, S, M>) -> Result<T>,
{
    transaction_with_mode(store, true, body)
}

fn transaction_with_mode<S, M, F, T>(store: &S, read_only: bool, body: F) -> Result<T>
where
    S: KvStore + ?Sized,
    M: Model + Clone,
    F: FnOnce(&mut Session<'_, '_, S, M>) -> Result<T>,
{
    if read_only {
        store.begin_read_only()?;
    } else {
        store.begin()?;
    }
    let mut map = TransactionMap::new(store);
    let mut session = Session::new(&mut map);

    let result = match body(&mut session) {
        Ok(value) => value,
        Err(e) => {
            store.rollback()?;
            return Err(e);
        }
    };

    if let Err(e) = session.flush() {
        store.rollback()?;
        return Err(e);
    }

    if map.changes.is_empty() && map.deletions.is_empty() {
        store.rollback()?;
        return Ok(result);
    }

    if read_only {
        let touched: Vec<String> = map.changes.keys().chain(map.deletions.iter()).cloned().collect();
        store.rollback()?;
        return Err(JacquardError::ReadOnlyCommit(touched));
    }

    store.commit(&map.changes, &map.deletions)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryStore;

    #[derive(Clone, Debug, PartialEq)]
    struct Widget {
        pk: String,
        label: String,
        dirty_forced: bool,
    }

    impl Model for Widget {
        fn storage_name() -> &'static str {
            "widgets"
        }

        fn pk(&self) -> String {
            self.pk.clone()
        }

        fn from_raw(pk: String, raw: Map<String, Value>) -> Result<Self> {
            let label = crate::odm::fields::TextField::get(&raw, "label", "")?;
            Ok(Widget {
                pk,
                label,
                dirty_forced: false,
            })
        }

        fn to_raw(&self) -> Result<Map<String, Value>> {
            let mut raw = Map::new();
            crate::odm::fields::TextField::set(&mut raw, "label", &self.label);
            Ok(raw)
        }

        fn empty(pk: String) -> Self {
            Widget {
                pk,
                label: String::new(),
                dirty_forced: false,
            }
        }
    }

    #[test]
    fn round_trips_through_flush() {
        let store = MemoryStore::new();

        transaction::<_, Widget, _, _>(&store, |session| {
            let mut w = session.get("a", GetDefault::CreateAndAdd)?;
            w.label = "hello".to_owned();
            session.mark_instance_dirty(&w);
            Ok(())
        })
        .unwrap();

        let fetched = transaction::<_, Widget, _, _>(&store, |session| {
            session.get("a", GetDefault::Raise)
        })
        .unwrap();
        assert_eq!(fetched.label, "hello");
    }

    #[test]
    fn remove_deletes_on_flush() {
        let store = MemoryStore::new();

        transaction::<_, Widget, _, _>(&store, |session| {
            let w = session.get("a", GetDefault::CreateAndAdd)?;
            Ok(w)
        })
        .unwrap();

        transaction::<_, Widget, _, _>(&store, |session| {
            let w = session.get("a", GetDefault::Raise)?;
            session.remove(&w);
            Ok(())
        })
        .unwrap();

        let result = transaction::<_, Widget, _, _>(&store, |session| {
            session.get("a", GetDefault::Raise)
        });
        assert!(result.is_err());
    }

    #[test]
    fn get_missing_with_raise_errors() {
        let store = MemoryStore::new();
        let result = transaction::<_, Widget, _, _>(&store, |session| {
            session.get("nope", GetDefault::Raise)
        });
        assert!(result.is_err());
    }
}
