/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Settings resolution: `defaults ⊕ bucket settings ⊕ overrides` for one
//! user, read-only and consulting the directory only when a bucket's
//! entries actually carry constraints.

use serde_json::{Map, Value};

use crate::bucket::{user_bucket, Bucket};
use crate::constraints::ConstraintContext;
use crate::directory::Directory;
use crate::error::{JacquardError, Result};
use crate::kv::KvStore;
use crate::odm::{self, GetDefault};

/// Resolve the settings a user sees right now: `defaults`, overridden by
/// whatever bucket entries apply to them, overridden in turn by any
/// per-user override record.
///
/// `directory` is only consulted when the user's bucket has at least one
/// entry carrying constraints; a bucket of purely universal entries never
/// triggers a lookup. Passing `None` for a bucket that does need one is a
/// [`JacquardError::ProgrammerError`], not a silent skip.
pub fn get_settings<S: KvStore + ?Sized>(
    store: &S,
    user_id: &str,
    now: chrono::DateTime<chrono::Utc>,
    directory: Option<&dyn Directory>,
) -> Result<Map<String, Value>> {
    odm::read_only_transaction::<_, Bucket, _, _>(store, |session| {
        let defaults: Map<String, Value> = session.raw().get_or("defaults", Map::new())?;

        let index = user_bucket(user_id);
        let bucket = session.get(&index.to_string(), GetDefault::EmptyInstance)?;

        let user = if bucket.needs_constraints() {
            let directory = directory.ok_or(JacquardError::ProgrammerError(
                "bucket requires constraint evaluation but no directory is configured",
            ))?;
            directory.lookup(user_id)?
        } else {
            None
        };

        let context = ConstraintContext { era_start_date: now };
        let bucket_settings = bucket.get_settings(user.as_ref(), &context);

        let overrides: Map<String, Value> =
            session.raw().get_or(&format!("overrides/{user_id}"), Map::new())?;

        let mut merged = defaults;
        for (k, v) in bucket_settings {
            merged.insert(k, v);
        }
        for (k, v) in overrides {
            merged.insert(k, v);
        }

        Ok(merged)
    })
}
