// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Jacquard: a split-testing and gradual-rollout control plane.
//!
//! A pluggable transactional key-value store ([`kv`]) backs an
//! object-document layer ([`odm`]) of typed records. On top of that sit
//! the domain modules: [`constraints`] (who a setting applies to),
//! [`bucket`] (the fixed-size ring that partitions user space),
//! [`release`]/[`experiment`] (allocating and retracting bucket capacity
//! across an experiment's lifecycle), [`resolver`] (what a given user
//! sees right now), and [`retry`] (the driver that reissues a unit of
//! work across optimistic-concurrency conflicts).

pub mod bucket;
pub mod config;
pub mod constraints;
pub mod directory;
pub mod error;
pub mod experiment;
pub mod kv;
pub mod odm;
pub mod release;
pub mod resolver;
pub mod retry;

pub use bucket::{Bucket, NUM_BUCKETS};
pub use config::Config;
pub use constraints::{ConstraintContext, Constraints, Era};
pub use directory::{Directory, EmptyDirectory, UserEntry};
pub use error::{JacquardError, Result};
pub use experiment::{Branch, Experiment};
pub use kv::KvStore;
pub use retry::with_retry;

/// The logical key `defaults` is stored under.
pub const DEFAULTS_KEY: &str = "defaults";
/// The logical key the list of currently-active experiment ids is stored
/// under.
pub const ACTIVE_EXPERIMENTS_KEY: &str = "active-experiments";
/// The logical key the list of concluded experiment ids is stored under.
pub const CONCLUDED_EXPERIMENTS_KEY: &str = "concluded-experiments";

/// The logical key one user's per-user setting overrides are stored
/// under.
pub fn override_key(user_id: &str) -> String {
    format!("overrides/{user_id}")
}

/// List every currently-active experiment's id, most-recently-launched
/// last (storage order is insertion order).
pub fn list_active_experiments<S: KvStore + ?Sized>(store: &S) -> Result<Vec<String>> {
    kv::transaction(store, true, |map| map.get_or(ACTIVE_EXPERIMENTS_KEY, Vec::new()))
}

/// List every concluded experiment's id.
pub fn list_concluded_experiments<S: KvStore + ?Sized>(store: &S) -> Result<Vec<String>> {
    kv::transaction(store, true, |map| map.get_or(CONCLUDED_EXPERIMENTS_KEY, Vec::new()))
}

/// Fetch one experiment's record by id, active, concluded, or still in
/// draft.
pub fn get_experiment<S: KvStore + ?Sized>(store: &S, id: &str) -> Result<Experiment> {
    kv::transaction(store, true, |map| {
        let value: serde_json::Value = map
            .get_opt(&format!("experiments/{id}"))?
            .ok_or_else(|| JacquardError::NoSuchExperiment(id.to_owned()))?;
        Experiment::from_json(&value)
    })
}
