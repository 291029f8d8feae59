/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The user-directory capability the core consumes but does not
//! implement. Grounded on `jacquard/directory/base.py`: the directory
//! engines themselves (SQL-backed, union-of-several, dummy-for-tests)
//! are out of scope here, but the trait they satisfy is not.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::Result;

/// One directory record: a named user's id, join date, and tag set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub id: String,
    pub join_date: DateTime<Utc>,
    pub tags: BTreeSet<String>,
}

impl UserEntry {
    pub fn new(id: impl Into<String>, join_date: DateTime<Utc>, tags: BTreeSet<String>) -> Self {
        UserEntry {
            id: id.into(),
            join_date,
            tags,
        }
    }
}

/// A source of truth for which users exist and when they joined.
pub trait Directory: Send + Sync {
    /// The named record for `user_id`, or `None` if it isn't known here.
    fn lookup(&self, user_id: &str) -> Result<Option<UserEntry>>;

    /// Every known user, for administrative and partitioning use.
    fn all_users(&self) -> Result<Vec<UserEntry>>;
}

/// A directory with no users at all — suitable for a deployment with no
/// named-user-dependent constraints in play.
pub struct EmptyDirectory;

impl Directory for EmptyDirectory {
    fn lookup(&self, _user_id: &str) -> Result<Option<UserEntry>> {
        Ok(None)
    }

    fn all_users(&self) -> Result<Vec<UserEntry>> {
        Ok(Vec::new())
    }
}
