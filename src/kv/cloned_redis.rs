/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A Redis-backed store that keeps a full local mirror of the data set,
//! kept live by a background thread subscribed to a pub/sub channel (with
//! a 30s poll as a backstop for missed notifications). Reads never touch
//! the network; only commits do.
//!
//! Grounded on `jacquard/storage/cloned_redis.py`. The whole data set
//! lives under one `jacquard-store:state:<token>` blob, addressed by a
//! `jacquard-store:state-key` pointer; a commit is a compare-and-swap on
//! that pointer via `WATCH`. We use JSON for the blob instead of pickle,
//! and a superseded blob is expired 30 minutes after being orphaned
//! rather than deleted immediately, so slow readers mid-flight don't see
//! it vanish out from under them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use redis::Commands;
use uuid::Uuid;

use crate::error::{JacquardError, Result};
use super::KvStore;

const STATE_KEY: &str = "jacquard-store:state-key";
const STATE_PREFIX: &str = "jacquard-store:state:";
const EXPIRE_SECONDS: i64 = 1800;

struct SharedPool {
    connection_string: String,
    inner: Mutex<PoolState>,
}

struct PoolState {
    state_key: Option<String>,
    data: BTreeMap<String, String>,
}

impl SharedPool {
    fn get_state(&self) -> (Option<String>, BTreeMap<String, String>) {
        let inner = self.inner.lock();
        (inner.state_key.clone(), inner.data.clone())
    }

    fn set_state(&self, state_key: String, data: BTreeMap<String, String>) {
        let mut inner = self.inner.lock();
        inner.state_key = Some(state_key);
        inner.data = data;
    }

    fn sync_from(&self, conn: &mut redis::Connection) {
        let state_key: Option<String> = conn.get(STATE_KEY).ok().flatten();
        let data = match &state_key {
            Some(key) => {
                let raw: Option<String> = conn.get(format!("{STATE_PREFIX}{key}")).ok().flatten();
                raw.and_then(|r| serde_json::from_str(&r).ok())
                    .unwrap_or_default()
            }
            None => BTreeMap::new(),
        };
        let mut inner = self.inner.lock();
        inner.state_key = state_key;
        inner.data = data;
    }
}

static POOLS: Lazy<StdMutex<HashMap<String, Arc<SharedPool>>>> =
    Lazy::new(|| StdMutex::new(HashMap::new()));

fn shared_pool(connection_string: &str) -> Result<Arc<SharedPool>> {
    let mut pools = POOLS
        .lock()
        .map_err(|_| JacquardError::ProgrammerError("cloned-redis pool registry poisoned"))?;

    if let Some(pool) = pools.get(connection_string) {
        return Ok(pool.clone());
    }

    let pool = Arc::new(SharedPool {
        connection_string: connection_string.to_owned(),
        inner: Mutex::new(PoolState {
            state_key: None,
            data: BTreeMap::new(),
        }),
    });

    let client = redis::Client::open(connection_string)?;
    let mut sync_conn = client.get_connection()?;
    pool.sync_from(&mut sync_conn);

    let spawn_pool = pool.clone();
    let spawn_client = client;
    let init = Once::new();
    init.call_once(|| {
        thread::spawn(move || cloned_redis_mirror_loop(spawn_pool, spawn_client));
    });

    pools.insert(connection_string.to_owned(), pool.clone());
    Ok(pool)
}

fn cloned_redis_mirror_loop(pool: Arc<SharedPool>, client: redis::Client) {
    loop {
        let conn = match client.get_connection() {
            Ok(c) => c,
            Err(_) => {
                thread::sleep(Duration::from_secs(10));
                continue;
            }
        };

        if conn.set_read_timeout(Some(Duration::from_secs(30))).is_err() {
            thread::sleep(Duration::from_secs(10));
            continue;
        }

        let mut pubsub = conn.into_pubsub();
        if pubsub.subscribe(STATE_KEY).is_err() {
            thread::sleep(Duration::from_secs(10));
            continue;
        }

        loop {
            // get_message blocks until a publish arrives or the read
            // timeout above fires; either way we resync, same as the
            // reference's 30s poll-on-silence fallback.
            match pubsub.get_message() {
                Ok(_) | Err(_) => pool.sync_from_pubsub(&client),
            }
        }
    }
}

impl SharedPool {
    fn sync_from_pubsub(&self, client: &redis::Client) {
        if let Ok(mut conn) = client.get_connection() {
            self.sync_from(&mut conn);
        }
    }
}

pub struct ClonedRedisStore {
    pool: Arc<SharedPool>,
    snapshot: Mutex<Option<(Option<String>, BTreeMap<String, String>)>>,
}

impl ClonedRedisStore {
    pub fn open(connection_string: &str) -> Result<Self> {
        Ok(ClonedRedisStore {
            pool: shared_pool(connection_string)?,
            snapshot: Mutex::new(None),
        })
    }

    fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let snap = self.snapshot.lock();
        match &*snap {
            Some((_, data)) => Ok(data.clone()),
            None => Err(JacquardError::ProgrammerError(
                "cloned-redis transaction used outside begin/commit",
            )),
        }
    }
}

impl KvStore for ClonedRedisStore {
    fn begin(&self) -> Result<()> {
        let state = self.pool.get_state();
        *self.snapshot.lock() = Some(state);
        Ok(())
    }

    fn commit(
        &self,
        changes: &BTreeMap<String, String>,
        deletions: &BTreeSet<String>,
    ) -> Result<()> {
        let (old_state_key, mut data) = {
            let mut snap = self.snapshot.lock();
            snap.take().ok_or(JacquardError::ProgrammerError(
                "commit called without a matching begin",
            ))?
        };

        let client = redis::Client::open(self.pool.connection_string.as_str())?;
        let mut conn = client.get_connection()?;

        conn.watch(STATE_KEY)?;
        let current_state_key: Option<String> = conn.get(STATE_KEY)?;

        if current_state_key != old_state_key {
            let _: () = redis::cmd("UNWATCH").query(&mut conn)?;
            self.pool.sync_from(&mut conn);
            return Err(JacquardError::Retry);
        }

        for (key, value) in changes {
            data.insert(key.clone(), value.clone());
        }
        for key in deletions {
            data.remove(key);
        }

        let new_state_key = Uuid::new_v4().to_string();
        let blob = serde_json::to_string(&data)?;

        let _: () = conn.set(format!("{STATE_PREFIX}{new_state_key}"), blob)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(STATE_KEY, &new_state_key);
        pipe.publish(STATE_KEY, &new_state_key);
        if let Some(old_key) = &old_state_key {
            pipe.expire(format!("{STATE_PREFIX}{old_key}"), EXPIRE_SECONDS);
        }

        let result: Option<Vec<redis::Value>> = pipe.query(&mut conn)?;
        if result.is_none() {
            return Err(JacquardError::Retry);
        }

        self.pool.set_state(new_state_key, data);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        *self.snapshot.lock() = None;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.snapshot()?.keys().cloned().collect())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.snapshot()?.get(key).cloned())
    }
}
