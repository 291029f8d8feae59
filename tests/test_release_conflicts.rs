/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::BTreeSet;

use jacquard::kv::memory::MemoryStore;
use jacquard::release::{self, human_readable_conflicts, BranchAllocation};
use jacquard::{Constraints, JacquardError};
use rand::rngs::mock::StepRng;

fn allocation(branch_id: &str, n_buckets: usize, setting: &str, value: &str) -> BranchAllocation {
    let mut settings = serde_json::Map::new();
    settings.insert(setting.to_owned(), serde_json::Value::String(value.to_owned()));
    BranchAllocation {
        branch_id: branch_id.to_owned(),
        n_buckets,
        settings,
    }
}

#[test]
fn a_full_rollout_blocks_any_other_release_on_the_same_setting() {
    let _ = env_logger::try_init();
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    release::release(
        &store,
        "existing-rollout",
        &Constraints::universal(),
        &[allocation("on", 1000, "color", "blue")],
        &mut rng,
    )
    .unwrap();

    let result = release::release(
        &store,
        "new-experiment",
        &Constraints::universal(),
        &[allocation("control", 1, "color", "green")],
        &mut rng,
    );

    match result {
        Err(JacquardError::NotEnoughBuckets { conflicts }) => {
            assert_eq!(conflicts, vec!["existing-rollout".to_owned()]);
            assert_eq!(human_readable_conflicts(&conflicts), "existing-rollout");
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
}

#[test]
fn a_rollout_named_with_the_sentinel_reads_as_a_rollout() {
    let conflicts = vec!["__ROLLOUT__".to_owned()];
    assert_eq!(human_readable_conflicts(&conflicts), "a rollout");
}

#[test]
fn disjoint_tag_constraints_can_cover_the_same_setting_without_conflict() {
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    let mut beta_only = Constraints::universal();
    beta_only.required_tags = BTreeSet::from(["beta".to_owned()]);

    release::release(
        &store,
        "beta-experiment",
        &beta_only,
        &[allocation("control", 1000, "theme", "dark")],
        &mut rng,
    )
    .unwrap();

    let mut excludes_beta = Constraints::universal();
    excludes_beta.excluded_tags = BTreeSet::from(["beta".to_owned()]);

    release::release(
        &store,
        "non-beta-experiment",
        &excludes_beta,
        &[allocation("control", 1000, "theme", "light")],
        &mut rng,
    )
    .unwrap();
}
