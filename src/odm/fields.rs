/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Field helpers for reading and writing a [`Model`](super::Model)'s raw
//! JSON map. Python's reference descriptor protocol (`__get__`/`__set__`)
//! doesn't have a direct Rust analogue, so each field type here is a small
//! value that a model's `from_raw`/`to_raw` calls explicitly, rather than
//! something bound to a struct attribute at access time.

use serde_json::{Map, Value};

use crate::error::{JacquardError, Result};

/// A plain UTF-8 string field.
pub struct TextField;

impl TextField {
    pub fn get(raw: &Map<String, Value>, key: &str, default: &str) -> Result<String> {
        match raw.get(key) {
            None => Ok(default.to_owned()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(JacquardError::ValidationError(format!(
                "field {key:?}: expected a string, got {other:?}"
            ))),
        }
    }

    pub fn set(raw: &mut Map<String, Value>, key: &str, value: &str) {
        raw.insert(key.to_owned(), Value::String(value.to_owned()));
    }
}

/// A scalar codec for a storage form that isn't its natural JSON shape —
/// a constraints object serialised with its own defaulting codec, for
/// example. Carries caller-supplied encode/decode function pointers and
/// doubles as the per-element codec [`ListField`] threads over an array,
/// mirroring how `buckets/models.py`'s `ListField` wraps an inner field
/// to decode each element.
pub struct EncodeDecodeField<T> {
    encode: fn(&T) -> Result<Value>,
    decode: fn(&Value) -> Result<T>,
}

impl<T: Clone> EncodeDecodeField<T> {
    pub const fn new(encode: fn(&T) -> Result<Value>, decode: fn(&Value) -> Result<T>) -> Self {
        EncodeDecodeField { encode, decode }
    }

    pub fn get(&self, raw: &Map<String, Value>, key: &str, default: &T) -> Result<T> {
        match raw.get(key) {
            None => Ok(default.clone()),
            Some(v) => (self.decode)(v),
        }
    }

    pub fn set(&self, raw: &mut Map<String, Value>, key: &str, value: &T) -> Result<()> {
        raw.insert(key.to_owned(), (self.encode)(value)?);
        Ok(())
    }
}

/// A JSON array whose elements are handled by an inner [`EncodeDecodeField`]
/// rather than `serde`'s blanket impl for `Vec<T>` — used when an
/// element's wire shape isn't simply its `Serialize` output (e.g. a
/// bucket entry's 3-tuple layout).
pub struct ListField<T> {
    element: EncodeDecodeField<T>,
}

impl<T> ListField<T> {
    pub const fn new(encode_item: fn(&T) -> Result<Value>, decode_item: fn(&Value) -> Result<T>) -> Self {
        ListField {
            element: EncodeDecodeField {
                encode: encode_item,
                decode: decode_item,
            },
        }
    }

    pub fn get(&self, raw: &Map<String, Value>, key: &str) -> Result<Vec<T>> {
        match raw.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().map(|item| (self.element.decode)(item)).collect(),
            Some(other) => Err(JacquardError::ValidationError(format!(
                "field {key:?}: expected an array, got {other:?}"
            ))),
        }
    }

    pub fn set(&self, raw: &mut Map<String, Value>, key: &str, values: &[T]) -> Result<()> {
        let encoded: Vec<Value> = values
            .iter()
            .map(|v| (self.element.encode)(v))
            .collect::<Result<_>>()?;
        raw.insert(key.to_owned(), Value::Array(encoded));
        Ok(())
    }
}
