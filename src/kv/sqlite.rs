/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A single-file embedded backend on top of `rusqlite`.
//!
//! Unlike the append-only log the Python reference keeps in `db.py`, this
//! is a plain two-column `(key, value)` table: a commit is one transaction
//! that deletes, then upserts, then commits. SQLite's own transaction
//! isolation gives us the conflict-or-success guarantee `KvStore::commit`
//! requires without needing our own version counters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::{JacquardError, Result};
use super::KvStore;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jacquard (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(
        &self,
        changes: &BTreeMap<String, String>,
        deletions: &BTreeSet<String>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|_| {
            JacquardError::ProgrammerError("sqlite connection mutex poisoned")
        })?;
        let txn = conn.transaction()?;
        for key in deletions {
            txn.execute("DELETE FROM jacquard WHERE key = ?1", [key])?;
        }
        for (key, value) in changes {
            txn.execute(
                "INSERT INTO jacquard (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| JacquardError::ProgrammerError("sqlite connection mutex poisoned"))?;
        let mut stmt = conn.prepare("SELECT key FROM jacquard")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| JacquardError::ProgrammerError("sqlite connection mutex poisoned"))?;
        let mut stmt = conn.prepare("SELECT value FROM jacquard WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::transaction;

    #[test]
    fn persists_across_transactions() {
        let store = SqliteStore::in_memory().unwrap();
        transaction(&store, false, |map| {
            map.set("foo", &"bar".to_owned())?;
            Ok(())
        })
        .unwrap();

        let value: String = transaction(&store, true, |map| map.get("foo")).unwrap();
        assert_eq!(value, "bar");
    }

    #[test]
    fn delete_removes_the_row() {
        let store = SqliteStore::in_memory().unwrap();
        transaction(&store, false, |map| {
            map.set("foo", &"bar".to_owned())?;
            Ok(())
        })
        .unwrap();
        transaction(&store, false, |map| map.delete("foo")).unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
