/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The one configuration object a deployment builds once and hands to
//! every request: a storage backend and (optionally) a user directory.
//!
//! Grounded on `jacquard/config.py::Config`, with its thread-local engine
//! re-opening dropped: every [`crate::kv::KvStore`] backend here already
//! synchronizes its own shared state internally (a mutex-guarded
//! connection, a connection pool, and so on), so one `Config` can be
//! shared across request threads behind an `Arc` without each thread
//! needing its own storage handle.

use std::sync::Arc;

use crate::directory::{Directory, EmptyDirectory};
use crate::kv::KvStore;

/// Everything the core needs to serve a request: where state lives, and
/// who's in it.
#[derive(Clone)]
pub struct Config {
    storage: Arc<dyn KvStore>,
    directory: Arc<dyn Directory>,
}

impl Config {
    pub fn new(storage: Arc<dyn KvStore>) -> Self {
        Config {
            storage,
            directory: Arc::new(EmptyDirectory),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn storage(&self) -> &dyn KvStore {
        self.storage.as_ref()
    }

    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryStore;

    #[test]
    fn defaults_to_an_empty_directory() {
        let config = Config::new(Arc::new(MemoryStore::new()));
        assert!(config.directory().lookup("alice").unwrap().is_none());
    }
}
