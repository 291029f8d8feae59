/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The bucket ring: a fixed number of partitions of user space, each
//! carrying an ordered list of conditionally-applied settings entries.
//! Grounded on `jacquard/buckets/models.py`, `jacquard/buckets/entry.py`,
//! and the hash in `jacquard/buckets/utils.py::user_bucket`.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::constraints::Constraints;
use crate::directory::UserEntry;
use crate::error::{JacquardError, Result};
use crate::odm::fields::ListField;
use crate::odm::Model;

/// Divisible by 2, 3, 4, 5, 6, 10 and 100, and at least 300 so every
/// percentage point of traffic gets at least 3 buckets. The reference
/// value named in the data model.
pub const NUM_BUCKETS: u64 = 1000;

/// Stable hash of a user id into `[0, NUM_BUCKETS)`. Must never change
/// across releases — it's the only thing keeping a user in the same
/// bucket from one lookup to the next.
pub fn user_bucket(user_id: &str) -> u64 {
    let digest = Sha256::digest(user_id.as_bytes());
    let mut acc: u64 = 0;
    for byte in digest.iter() {
        acc = acc.wrapping_mul(256).wrapping_add(*byte as u64) % NUM_BUCKETS;
    }
    acc
}

/// An opaque identity for a bucket entry: `[release_name, branch_id]`,
/// or `["__ROLLOUT__", setting]` for a plain rollout. Used only for
/// removal and coverage queries, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey(pub String, pub String);

impl EntryKey {
    pub fn new(release_name: impl Into<String>, branch_id: impl Into<String>) -> Self {
        EntryKey(release_name.into(), branch_id.into())
    }

    pub fn release_name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: EntryKey,
    pub settings: Map<String, Value>,
    pub constraints: Constraints,
}

fn encode_key(key: &EntryKey) -> Value {
    Value::Array(vec![
        Value::String(key.0.clone()),
        Value::String(key.1.clone()),
    ])
}

fn decode_key(value: &Value) -> Result<EntryKey> {
    let arr = value
        .as_array()
        .ok_or_else(|| JacquardError::ValidationError("entry key must be a 2-element array".into()))?;
    if arr.len() != 2 {
        return Err(JacquardError::ValidationError(
            "entry key must have exactly 2 elements".into(),
        ));
    }
    let first = arr[0]
        .as_str()
        .ok_or_else(|| JacquardError::ValidationError("entry key elements must be strings".into()))?;
    let second = arr[1]
        .as_str()
        .ok_or_else(|| JacquardError::ValidationError("entry key elements must be strings".into()))?;
    Ok(EntryKey(first.to_owned(), second.to_owned()))
}

fn encode_entry(entry: &Entry) -> Result<Value> {
    Ok(Value::Array(vec![
        encode_key(&entry.key),
        Value::Object(entry.settings.clone()),
        entry.constraints.to_json(),
    ]))
}

fn decode_entry(value: &Value) -> Result<Entry> {
    let arr = value
        .as_array()
        .ok_or_else(|| JacquardError::ValidationError("entry must be a 3-element array".into()))?;
    if arr.len() != 3 {
        return Err(JacquardError::ValidationError(
            "entry must have exactly 3 elements".into(),
        ));
    }

    let key = decode_key(&arr[0])?;
    let settings = arr[1]
        .as_object()
        .cloned()
        .ok_or_else(|| JacquardError::ValidationError("entry settings must be an object".into()))?;
    let constraints = Constraints::from_json(&arr[2])?;

    Ok(Entry {
        key,
        settings,
        constraints,
    })
}

static ENTRIES_FIELD: ListField<Entry> = ListField::new(encode_entry, decode_entry);

/// One partition of user space, stored under `buckets/<index>`.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub index: u64,
    pub entries: Vec<Entry>,
}

impl Bucket {
    pub fn new(index: u64) -> Self {
        Bucket {
            index,
            entries: Vec::new(),
        }
    }

    /// Append an entry. Does not check for key collisions; callers
    /// (release) are responsible for bucket validity before calling this.
    pub fn add(&mut self, key: EntryKey, settings: Map<String, Value>, constraints: Constraints) {
        self.entries.push(Entry {
            key,
            settings,
            constraints,
        });
    }

    /// Drop every entry with this key.
    pub fn remove(&mut self, key: &EntryKey) {
        self.entries.retain(|e| &e.key != key);
    }

    pub fn covers(&self, key: &EntryKey) -> bool {
        self.entries.iter().any(|e| &e.key == key)
    }

    /// Merge settings from every entry whose constraints are universal or
    /// whose `matches_user` accepts this user. Later entries win on a
    /// setting-name collision.
    pub fn get_settings(
        &self,
        user: Option<&UserEntry>,
        context: &crate::constraints::ConstraintContext,
    ) -> Map<String, Value> {
        let mut settings = Map::new();

        for entry in &self.entries {
            let applies = entry.constraints == Constraints::universal()
                || entry.constraints.matches_user(user, context);
            if applies {
                for (k, v) in &entry.settings {
                    settings.insert(k.clone(), v.clone());
                }
            }
        }

        settings
    }

    /// Whether resolving this bucket's settings requires a directory
    /// lookup at all.
    pub fn needs_constraints(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.constraints != Constraints::universal())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Model for Bucket {
    fn storage_name() -> &'static str {
        "buckets"
    }

    fn pk(&self) -> String {
        self.index.to_string()
    }

    fn from_raw(pk: String, raw: Map<String, Value>) -> Result<Self> {
        let index: u64 = pk
            .parse()
            .map_err(|_| JacquardError::ValidationError(format!("invalid bucket index {pk:?}")))?;
        let entries = ENTRIES_FIELD.get(&raw, "entries")?;
        Ok(Bucket { index, entries })
    }

    fn to_raw(&self) -> Result<Map<String, Value>> {
        let mut raw = Map::new();
        ENTRIES_FIELD.set(&mut raw, "entries", &self.entries)?;
        Ok(raw)
    }

    fn empty(pk: String) -> Self {
        let index: u64 = pk.parse().unwrap_or(0);
        Bucket::new(index)
    }

    fn transitional_upgrade_raw_data(raw: Value) -> Value {
        match raw {
            Value::Array(items) => {
                let mut map = Map::new();
                map.insert("entries".to_owned(), Value::Array(items));
                Value::Object(map)
            }
            other => other,
        }
    }
}
