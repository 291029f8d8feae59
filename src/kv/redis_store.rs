/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A remote backend against a single Redis (or Redis-protocol-compatible)
//! server. Conflict detection rides on `WATCH`/`MULTI`/`EXEC`: every key
//! read during a transaction is watched, and the commit pipeline aborts
//! (EXEC returns nil) if any of them changed underneath us.
//!
//! Grounded on `jacquard/storage/redis.py`. Logical keys are namespaced
//! under a fixed `jacquard:` prefix and use `/` as their path separator;
//! `/` is rewritten to `:` for storage, so a logical key containing a
//! literal `:` would collide and is rejected up front.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use redis::Commands;

use crate::error::{JacquardError, Result};
use super::KvStore;

const PREFIX: &str = "jacquard:";

pub struct RedisStore {
    conn: Mutex<redis::Connection>,
    read_only: AtomicBool,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(RedisStore {
            conn: Mutex::new(conn),
            read_only: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, redis::Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for RedisStore {
    fn begin(&self) -> Result<()> {
        self.read_only.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn begin_read_only(&self) -> Result<()> {
        self.read_only.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn encode_key(&self, key: &str) -> Result<String> {
        if key.contains(':') {
            return Err(JacquardError::InvalidKey(key.to_owned()));
        }
        Ok(format!("{PREFIX}{}", key.replace('/', ":")))
    }

    fn decode_key(&self, key: &str) -> Result<String> {
        key.strip_prefix(PREFIX)
            .map(|rest| rest.replace(':', "/"))
            .ok_or_else(|| JacquardError::InvalidKey(key.to_owned()))
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.lock();
        if !self.read_only.load(Ordering::SeqCst) {
            conn.watch(key)?;
        }
        let value: Option<String> = conn.get(key)?;
        Ok(value)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut conn = self.lock();
        let pattern = format!("{PREFIX}*");
        let mut keys: Vec<String> = conn.keys(pattern)?;
        keys.sort();
        Ok(keys)
    }

    fn commit(
        &self,
        changes: &BTreeMap<String, String>,
        deletions: &BTreeSet<String>,
    ) -> Result<()> {
        let mut conn = self.lock();

        if changes.is_empty() && deletions.is_empty() {
            let _: () = redis::cmd("UNWATCH").query(&mut *conn)?;
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in deletions {
            pipe.del(key);
        }
        for (key, value) in changes {
            pipe.set(key, value);
        }

        let result: Option<Vec<redis::Value>> = pipe.query(&mut *conn)?;
        match result {
            Some(_) => Ok(()),
            None => Err(JacquardError::Retry),
        }
    }

    fn rollback(&self) -> Result<()> {
        let mut conn = self.lock();
        let _: () = redis::cmd("UNWATCH").query(&mut *conn)?;
        Ok(())
    }
}
