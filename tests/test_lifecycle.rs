/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use jacquard::kv::memory::MemoryStore;
use jacquard::{experiment, resolver, JacquardError};
use rand::rngs::mock::StepRng;

fn now() -> DateTime<Utc> {
    "2020-06-15T00:00:00Z".parse().unwrap()
}

fn two_branch_definition(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "branches": [
            {"id": "control", "settings": {"color": "blue"}},
            {"id": "treatment", "settings": {"color": "red"}},
        ],
    })
}

#[test]
fn basic_rollout_assigns_settings_to_some_user() {
    let _ = env_logger::try_init();
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    experiment::load(&store, &two_branch_definition("color-experiment"), false).unwrap();
    experiment::launch(&store, "color-experiment", now(), false, &mut rng).unwrap();

    let settings_for_everyone: Vec<_> = ["alice", "bob", "carol", "dave", "eve"]
        .iter()
        .map(|id| resolver::get_settings(&store, id, now(), None).unwrap())
        .collect();

    assert!(settings_for_everyone
        .iter()
        .any(|s| s.get("color").map(|v| v == "blue").unwrap_or(false)));
}

#[test]
fn launching_twice_without_relaunch_fails() {
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    experiment::load(&store, &two_branch_definition("e1"), false).unwrap();
    experiment::launch(&store, "e1", now(), false, &mut rng).unwrap();

    let result = experiment::launch(&store, "e1", now(), false, &mut rng);
    assert!(matches!(result, Err(JacquardError::IllegalTransition(_))));
}

#[test]
fn relaunch_after_conclude_is_allowed_with_the_flag() {
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    experiment::load(&store, &two_branch_definition("e1"), false).unwrap();
    experiment::launch(&store, "e1", now(), false, &mut rng).unwrap();
    experiment::conclude(&store, "e1", None, now()).unwrap();

    let without_flag = experiment::launch(&store, "e1", now(), false, &mut rng);
    assert!(matches!(without_flag, Err(JacquardError::IllegalTransition(_))));

    let relaunched = experiment::launch(&store, "e1", now(), true, &mut rng).unwrap();
    assert!(relaunched.concluded.is_none());
    assert!(relaunched.launched.is_some());

    let active = jacquard::list_active_experiments(&store).unwrap();
    let concluded = jacquard::list_concluded_experiments(&store).unwrap();
    assert!(active.contains(&"e1".to_owned()));
    assert!(!concluded.contains(&"e1".to_owned()));
}

#[test]
fn concluding_promotes_branch_settings_into_defaults() {
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    experiment::load(&store, &two_branch_definition("e1"), false).unwrap();
    experiment::launch(&store, "e1", now(), false, &mut rng).unwrap();
    experiment::conclude(&store, "e1", Some("treatment"), now()).unwrap();

    let settings = resolver::get_settings(&store, "anyone", now(), None).unwrap();
    assert_eq!(settings.get("color").unwrap(), "red");
}

#[test]
fn loading_an_active_experiment_definition_is_rejected_without_skip_launched() {
    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    experiment::load(&store, &two_branch_definition("e1"), false).unwrap();
    experiment::launch(&store, "e1", now(), false, &mut rng).unwrap();

    let result = experiment::load(&store, &two_branch_definition("e1"), false);
    assert!(matches!(result, Err(JacquardError::IllegalTransition(_))));

    experiment::load(&store, &two_branch_definition("e1"), true).unwrap();
}

#[test]
fn era_specialised_constraints_at_launch_bound_eligibility_by_join_date() {
    struct StaticDirectory(jacquard::UserEntry);
    impl jacquard::Directory for StaticDirectory {
        fn lookup(&self, user_id: &str) -> jacquard::Result<Option<jacquard::UserEntry>> {
            if user_id == self.0.id {
                Ok(Some(self.0.clone()))
            } else {
                Ok(None)
            }
        }
        fn all_users(&self) -> jacquard::Result<Vec<jacquard::UserEntry>> {
            Ok(vec![self.0.clone()])
        }
    }

    let store = MemoryStore::new();
    let mut rng = StepRng::new(0, 1);

    let definition = serde_json::json!({
        "id": "old-timers-only",
        "branches": [{"id": "control", "settings": {"feature": "on"}}],
        "constraints": {"era": "old"},
    });
    experiment::load(&store, &definition, false).unwrap();
    experiment::launch(&store, "old-timers-only", now(), false, &mut rng).unwrap();

    let old_user = jacquard::UserEntry::new("old-user", "2019-01-01T00:00:00Z".parse().unwrap(), BTreeSet::new());
    let directory = StaticDirectory(old_user.clone());
    let settings = resolver::get_settings(&store, &old_user.id, now(), Some(&directory)).unwrap();
    assert_eq!(settings.get("feature").unwrap(), "on");

    let new_user = jacquard::UserEntry::new("new-user", "2021-01-01T00:00:00Z".parse().unwrap(), BTreeSet::new());
    let directory = StaticDirectory(new_user.clone());
    let settings = resolver::get_settings(&store, &new_user.id, now(), Some(&directory)).unwrap();
    assert!(settings.get("feature").is_none());
}
