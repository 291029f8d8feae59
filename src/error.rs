/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The error type for the experiment/bucket assignment core.
//!
//! One flat enum, one variant per failure kind named in the spec, with
//! `#[from]` conversions for the backend error types we wrap.

pub use log::{debug, error, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum JacquardError {
    /// Signalled by a KV backend on commit conflict. Recovered by the
    /// retry driver; guaranteed never to be raised from a read-only
    /// transaction.
    #[error("conflicting concurrent write, retry the operation")]
    Retry,

    #[error("not found: {0}")]
    NotFound(String),

    /// A release could not be satisfied; carries the release names it
    /// collided with so a caller can say "conflicts with X, Y".
    #[error("not enough buckets to satisfy this release")]
    NotEnoughBuckets { conflicts: Vec<String> },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// A caller misused the API in a way that should fail fast rather
    /// than be recovered from: a commit in a read-only transaction, an
    /// instance attached to two sessions, a bucket needing a directory
    /// lookup when none is configured, and similar.
    #[error("programmer error: {0}")]
    ProgrammerError(&'static str),

    #[error("commit attempted in a read-only transaction, touched keys: {0:?}")]
    ReadOnlyCommit(Vec<String>),

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[cfg(feature = "sqlite-backend")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(any(feature = "redis-backend", feature = "cloned-redis-backend"))]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "etcd-backend")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the experiment {0:?} does not exist")]
    NoSuchExperiment(String),

    #[error("the branch {1:?} does not exist for experiment {0:?}")]
    NoSuchBranch(String, String),
}

pub type Result<T, E = JacquardError> = std::result::Result<T, E>;
