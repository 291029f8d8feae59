/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Release and close: the operation that allocates bucket-ring capacity
//! to an experiment's branches without letting two releases collide on
//! the same setting for the same user, and its inverse.
//!
//! Grounded on `jacquard/buckets/utils.py::release`/`close`, generalized
//! per the data model with the constraint-disjointness escape hatch (the
//! archived version only checks setting-key disjointness) and the
//! conflict payload from `jacquard/buckets/exceptions.py::NotEnoughBucketsException`.

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};

use crate::bucket::{Bucket, EntryKey, NUM_BUCKETS};
use crate::constraints::Constraints;
use crate::error::{JacquardError, Result};
use crate::kv::KvStore;
use crate::odm::{self, GetDefault};

/// One branch's requested allocation within a release.
pub struct BranchAllocation {
    pub branch_id: String,
    pub n_buckets: usize,
    pub settings: Map<String, Value>,
}

/// Allocate buckets to `branches` under the release name `name`, with
/// `constraints` applied to every entry written. Fails with
/// [`JacquardError::NotEnoughBuckets`] if any branch's requested count
/// can't be satisfied from the valid pool, naming the releases that
/// collided with the new one.
pub fn release<S, R>(
    store: &S,
    name: &str,
    constraints: &Constraints,
    branches: &[BranchAllocation],
    rng: &mut R,
) -> Result<()>
where
    S: KvStore + ?Sized,
    R: Rng + ?Sized,
{
    odm::transaction::<_, Bucket, _, _>(store, |session| {
        release_within(session, name, constraints, branches, rng)
    })
}

/// Same as [`release`], but runs against an already-open bucket session —
/// for callers (the experiment launch lifecycle) that need the bucket
/// mutation and other record writes to land in one transaction.
pub fn release_within<S, R>(
    session: &mut odm::Session<'_, '_, S, Bucket>,
    name: &str,
    constraints: &Constraints,
    branches: &[BranchAllocation],
    rng: &mut R,
) -> Result<()>
where
    S: KvStore + ?Sized,
    R: Rng + ?Sized,
{
    let edited_settings: BTreeSet<&str> = branches
        .iter()
        .flat_map(|b| b.settings.keys().map(String::as_str))
        .collect();

    let mut buckets = Vec::with_capacity(NUM_BUCKETS as usize);
    for idx in 0..NUM_BUCKETS {
        buckets.push(session.get(&idx.to_string(), GetDefault::EmptyInstance)?);
    }

    let mut valid_indices = Vec::new();
    let mut conflicts = BTreeSet::new();

    for (idx, bucket) in buckets.iter().enumerate() {
        let mut valid = true;
        for entry in &bucket.entries {
            let overlaps_settings = entry.settings.keys().any(|k| edited_settings.contains(k.as_str()));
            if overlaps_settings && !entry.constraints.is_provably_disjoint_from(constraints) {
                valid = false;
                conflicts.insert(entry.key.release_name().to_owned());
            }
        }
        if valid {
            valid_indices.push(idx);
        }
    }

    valid_indices.shuffle(rng);
    let mut remaining = &valid_indices[..];

    for branch in branches {
        if remaining.len() < branch.n_buckets {
            return Err(JacquardError::NotEnoughBuckets {
                conflicts: conflicts.into_iter().collect(),
            });
        }

        let (selected, rest) = remaining.split_at(branch.n_buckets);
        remaining = rest;

        let key = EntryKey::new(name, &branch.branch_id);
        for &idx in selected {
            buckets[idx].add(key.clone(), branch.settings.clone(), constraints.clone());
            session.mark_instance_dirty(&buckets[idx]);
        }
    }

    Ok(())
}

/// Remove every entry belonging to `name`'s `branch_ids` from every
/// bucket. A bucket left with no entries is deleted rather than stored
/// as an empty record.
pub fn close<S: KvStore + ?Sized>(store: &S, name: &str, branch_ids: &[String]) -> Result<()> {
    odm::transaction::<_, Bucket, _, _>(store, |session| close_within(session, name, branch_ids))
}

/// Same as [`close`], but runs against an already-open bucket session.
pub fn close_within<S: KvStore + ?Sized>(
    session: &mut odm::Session<'_, '_, S, Bucket>,
    name: &str,
    branch_ids: &[String],
) -> Result<()> {
    for idx in 0..NUM_BUCKETS {
        let pk = idx.to_string();
        let mut bucket = session.get(&pk, GetDefault::EmptyInstance)?;
        let before = bucket.entries.len();

        for branch_id in branch_ids {
            bucket.remove(&EntryKey::new(name, branch_id));
        }

        if bucket.entries.len() == before {
            continue;
        }

        if bucket.is_empty() {
            session.remove(&bucket);
        } else {
            session.mark_instance_dirty(&bucket);
        }
    }

    Ok(())
}

/// Render a `NotEnoughBuckets` conflict set for display, e.g. "conflicts
/// with rollout-a, experiment-b".
pub fn human_readable_conflicts(conflicts: &[String]) -> String {
    let mut sorted: Vec<&str> = conflicts.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    sorted
        .iter()
        .map(|name| format_conflict(name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_conflict(name: &str) -> String {
    if name == "__ROLLOUT__" {
        "a rollout".to_owned()
    } else {
        name.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryStore;
    use rand::rngs::mock::StepRng;

    fn settings(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn release_then_close_round_trips() {
        let store = MemoryStore::new();
        let mut rng = StepRng::new(0, 1);

        release(
            &store,
            "exp-a",
            &Constraints::universal(),
            &[BranchAllocation {
                branch_id: "control".to_owned(),
                n_buckets: 10,
                settings: settings(&[("color", "blue")]),
            }],
            &mut rng,
        )
        .unwrap();

        let covering = odm::transaction::<_, Bucket, _, _>(&store, |session| {
            let mut count = 0;
            for idx in 0..NUM_BUCKETS {
                let bucket = session.get(&idx.to_string(), GetDefault::EmptyInstance)?;
                if bucket.covers(&EntryKey::new("exp-a", "control")) {
                    count += 1;
                }
            }
            Ok(count)
        })
        .unwrap();
        assert_eq!(covering, 10);

        close(&store, "exp-a", &["control".to_owned()]).unwrap();

        let remaining = odm::transaction::<_, Bucket, _, _>(&store, |session| {
            let mut count = 0;
            for idx in 0..NUM_BUCKETS {
                let bucket = session.get(&idx.to_string(), GetDefault::EmptyInstance)?;
                if bucket.covers(&EntryKey::new("exp-a", "control")) {
                    count += 1;
                }
            }
            Ok(count)
        })
        .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn fails_when_not_enough_disjoint_buckets_remain() {
        let store = MemoryStore::new();
        let mut rng = StepRng::new(0, 1);

        release(
            &store,
            "exp-a",
            &Constraints::universal(),
            &[BranchAllocation {
                branch_id: "control".to_owned(),
                n_buckets: NUM_BUCKETS as usize,
                settings: settings(&[("color", "blue")]),
            }],
            &mut rng,
        )
        .unwrap();

        let result = release(
            &store,
            "exp-b",
            &Constraints::universal(),
            &[BranchAllocation {
                branch_id: "control".to_owned(),
                n_buckets: 1,
                settings: settings(&[("color", "red")]),
            }],
            &mut rng,
        );

        match result {
            Err(JacquardError::NotEnoughBuckets { conflicts }) => {
                assert_eq!(conflicts, vec!["exp-a".to_owned()]);
            }
            other => panic!("expected NotEnoughBuckets, got {other:?}"),
        }
    }

    #[test]
    fn disjoint_constraints_allow_overlapping_settings() {
        let store = MemoryStore::new();
        let mut rng = StepRng::new(0, 1);

        let mut only_foo = Constraints::universal();
        only_foo.required_tags = BTreeSet::from(["foo".to_owned()]);

        release(
            &store,
            "exp-a",
            &only_foo,
            &[BranchAllocation {
                branch_id: "control".to_owned(),
                n_buckets: NUM_BUCKETS as usize,
                settings: settings(&[("color", "blue")]),
            }],
            &mut rng,
        )
        .unwrap();

        let mut excludes_foo = Constraints::universal();
        excludes_foo.excluded_tags = BTreeSet::from(["foo".to_owned()]);

        release(
            &store,
            "exp-b",
            &excludes_foo,
            &[BranchAllocation {
                branch_id: "control".to_owned(),
                n_buckets: NUM_BUCKETS as usize,
                settings: settings(&[("color", "red")]),
            }],
            &mut rng,
        )
        .unwrap();
    }
}
