/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A replicated-coordination backend on top of etcd.
//!
//! The whole data set lives as one JSON document under a single key.
//! Conflict detection is etcd's `mod_revision`: a commit writes with a
//! compare-on-mod-revision transaction, and loses the race (and raises
//! [`JacquardError::Retry`]) if another writer touched the key first.
//! A background watch keeps a local mirror current between transactions
//! so `begin` rarely needs a network round trip.
//!
//! `etcd-client` is async; this crate's `KvStore` trait is not, so every
//! backend method bridges onto a dedicated multi-thread [`tokio::runtime::Runtime`].
//! Grounded on `jacquard/storage/etcd.py`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};
use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::error::{JacquardError, Result};
use super::KvStore;

struct Mirror {
    data: String,
    mod_revision: Option<i64>,
}

pub struct EtcdStore {
    runtime: Runtime,
    client: Client,
    path: String,
    mirror: Arc<Mutex<Mirror>>,
    snapshot: Mutex<Option<(BTreeMap<String, String>, Option<i64>)>>,
}

impl EtcdStore {
    pub fn open(endpoints: &[&str], path: &str) -> Result<Self> {
        let runtime = Runtime::new()?;
        let (client, initial) = runtime.block_on(async {
            let mut client = Client::connect(endpoints, None).await?;
            let resp = client.get(path, None).await?;
            let kv = resp.kvs().first();
            let mirror = match kv {
                Some(kv) => Mirror {
                    data: String::from_utf8_lossy(kv.value()).into_owned(),
                    mod_revision: Some(kv.mod_revision()),
                },
                None => Mirror {
                    data: "{}".to_owned(),
                    mod_revision: None,
                },
            };
            Ok::<_, etcd_client::Error>((client, mirror))
        })?;

        let mirror = Arc::new(Mutex::new(initial));
        let watch_client = client.clone();
        let watch_mirror = mirror.clone();
        let watch_path = path.to_owned();
        runtime.spawn(async move {
            watch_loop(watch_client, watch_path, watch_mirror).await;
        });

        Ok(EtcdStore {
            runtime,
            client,
            path: path.to_owned(),
            mirror,
            snapshot: Mutex::new(None),
        })
    }

    fn decode(&self) -> Result<BTreeMap<String, String>> {
        let snap = self.snapshot.lock();
        match &*snap {
            Some((data, _)) => Ok(data.clone()),
            None => Err(JacquardError::ProgrammerError(
                "etcd transaction used outside begin/commit",
            )),
        }
    }
}

async fn watch_loop(mut client: Client, path: String, mirror: Arc<Mutex<Mirror>>) {
    let (mut watcher, mut stream) = match client.watch(path.clone(), None).await {
        Ok(pair) => pair,
        Err(_) => return,
    };
    let _ = watcher.request_progress().await;

    while let Ok(Some(resp)) = stream.message().await {
        for event in resp.events() {
            if let Some(kv) = event.kv() {
                let mut m = mirror.lock();
                m.data = String::from_utf8_lossy(kv.value()).into_owned();
                m.mod_revision = Some(kv.mod_revision());
            }
        }
    }
}

impl KvStore for EtcdStore {
    fn begin(&self) -> Result<()> {
        let (data, mod_revision) = {
            let m = self.mirror.lock();
            (m.data.clone(), m.mod_revision)
        };
        let decoded: BTreeMap<String, String> = serde_json::from_str(&data)?;
        *self.snapshot.lock() = Some((decoded, mod_revision));
        Ok(())
    }

    fn commit(
        &self,
        changes: &BTreeMap<String, String>,
        deletions: &BTreeSet<String>,
    ) -> Result<()> {
        let (mut data, mod_revision) = {
            let mut snap = self.snapshot.lock();
            snap.take().ok_or(JacquardError::ProgrammerError(
                "commit called without a matching begin",
            ))?
        };

        for (key, value) in changes {
            data.insert(key.clone(), value.clone());
        }
        for key in deletions {
            data.remove(key);
        }

        let serialized = serde_json::to_string(&data)?;
        let path = self.path.clone();
        let mut client = self.client.clone();

        let succeeded = self.runtime.block_on(async move {
            let compare = match mod_revision {
                Some(rev) => Compare::mod_revision(path.clone(), CompareOp::Equal, rev),
                None => Compare::create_revision(path.clone(), CompareOp::Equal, 0),
            };
            let txn = Txn::new()
                .when(vec![compare])
                .and_then(vec![TxnOp::put(path.clone(), serialized, None)]);
            client.txn(txn).await
        })?;

        if !succeeded.succeeded() {
            let mut m = self.mirror.lock();
            if let Ok(resp) = self.runtime.block_on(self.client.clone().get(self.path.clone(), None)) {
                if let Some(kv) = resp.kvs().first() {
                    m.data = String::from_utf8_lossy(kv.value()).into_owned();
                    m.mod_revision = Some(kv.mod_revision());
                }
            }
            return Err(JacquardError::Retry);
        }

        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        *self.snapshot.lock() = None;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.decode()?.keys().cloned().collect())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.decode()?.get(key).cloned())
    }
}
