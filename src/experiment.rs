/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Experiment records and their launch/conclude lifecycle.
//!
//! Grounded on `jacquard/experiments/experiment.py::Experiment` for the
//! record shape and JSON codec, and `jacquard/experiments/commands.py`'s
//! `Launch`/`Conclude`/`Load` for the lifecycle — generalized to also
//! drive the bucket release/close algorithm, which that archived command
//! layer's early revision predates.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};

use crate::bucket::{Bucket, NUM_BUCKETS};
use crate::constraints::{ConstraintContext, Constraints};
use crate::error::{JacquardError, Result};
use crate::kv::KvStore;
use crate::odm;
use crate::release::{self, BranchAllocation};

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub id: String,
    pub settings: Map<String, Value>,
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    pub branches: Vec<Branch>,
    pub constraints: Constraints,
    pub launched: Option<DateTime<Utc>>,
    pub concluded: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| JacquardError::ValidationError("experiment definition must be an object".into()))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| JacquardError::ValidationError("experiment definition missing \"id\"".into()))?
            .to_owned();

        let raw_branches = obj
            .get("branches")
            .and_then(Value::as_array)
            .ok_or_else(|| JacquardError::ValidationError("experiment definition missing \"branches\"".into()))?;

        if raw_branches.is_empty() {
            return Err(JacquardError::ValidationError(
                "experiment must declare at least one branch".into(),
            ));
        }

        let mut branches = Vec::with_capacity(raw_branches.len());
        let mut seen_ids = BTreeSet::new();

        for raw_branch in raw_branches {
            let branch_obj = raw_branch
                .as_object()
                .ok_or_else(|| JacquardError::ValidationError("branch must be an object".into()))?;
            let branch_id = branch_obj
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| JacquardError::ValidationError("branch missing \"id\"".into()))?
                .to_owned();

            if !seen_ids.insert(branch_id.clone()) {
                return Err(JacquardError::ValidationError(format!(
                    "duplicate branch id {branch_id:?}"
                )));
            }

            let settings = branch_obj
                .get("settings")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            let percent = match branch_obj.get("percent") {
                Some(v) => Some(v.as_f64().ok_or_else(|| {
                    JacquardError::ValidationError(format!("branch {branch_id:?} percent must be a number"))
                })?),
                None => None,
            };

            branches.push(Branch {
                id: branch_id,
                settings,
                percent,
            });
        }

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| id.clone());

        let constraints = match obj.get("constraints") {
            Some(v) => Constraints::from_json(v)?,
            None => Constraints::universal(),
        };

        let launched = match obj.get("launched") {
            Some(v) => Some(parse_timestamp(v, "launched")?),
            None => None,
        };
        let concluded = match obj.get("concluded") {
            Some(v) => Some(parse_timestamp(v, "concluded")?),
            None => None,
        };

        if concluded.is_some() && launched.is_none() {
            return Err(JacquardError::ValidationError(
                "an experiment cannot be concluded without having been launched".into(),
            ));
        }
        if let (Some(l), Some(c)) = (launched, concluded) {
            if l > c {
                return Err(JacquardError::ValidationError(
                    "an experiment's launch time cannot be after its conclusion time".into(),
                ));
            }
        }

        Ok(Experiment {
            id,
            name,
            branches,
            constraints,
            launched,
            concluded,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_owned(), Value::String(self.id.clone()));
        obj.insert(
            "branches".to_owned(),
            Value::Array(
                self.branches
                    .iter()
                    .map(|b| {
                        let mut branch_obj = Map::new();
                        branch_obj.insert("id".to_owned(), Value::String(b.id.clone()));
                        branch_obj.insert("settings".to_owned(), Value::Object(b.settings.clone()));
                        if let Some(percent) = b.percent {
                            branch_obj.insert(
                                "percent".to_owned(),
                                serde_json::Number::from_f64(percent)
                                    .map(Value::Number)
                                    .unwrap_or(Value::Null),
                            );
                        }
                        Value::Object(branch_obj)
                    })
                    .collect(),
            ),
        );

        let constraints_json = self.constraints.to_json();
        if constraints_json.as_object().is_some_and(|m| !m.is_empty()) {
            obj.insert("constraints".to_owned(), constraints_json);
        }
        if self.name != self.id {
            obj.insert("name".to_owned(), Value::String(self.name.clone()));
        }
        if let Some(ts) = self.launched {
            obj.insert("launched".to_owned(), Value::String(ts.to_rfc3339()));
        }
        if let Some(ts) = self.concluded {
            obj.insert("concluded".to_owned(), Value::String(ts.to_rfc3339()));
        }

        Value::Object(obj)
    }

    pub fn branch(&self, branch_id: &str) -> Result<&Branch> {
        self.branches
            .iter()
            .find(|b| b.id == branch_id)
            .ok_or_else(|| JacquardError::NoSuchBranch(self.id.clone(), branch_id.to_owned()))
    }
}

fn parse_timestamp(value: &Value, field: &str) -> Result<DateTime<Utc>> {
    let raw = value
        .as_str()
        .ok_or_else(|| JacquardError::ValidationError(format!("{field} must be a string")))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| JacquardError::ValidationError(format!("{field} must be an RFC3339 timestamp, got {raw:?}")))
}

fn experiment_key(id: &str) -> String {
    format!("experiments/{id}")
}

fn read_experiment<S: KvStore + ?Sized>(
    session: &mut odm::Session<'_, '_, S, Bucket>,
    id: &str,
) -> Result<Experiment> {
    let value = session
        .raw()
        .get::<Value>(&experiment_key(id))
        .map_err(|_| JacquardError::NoSuchExperiment(id.to_owned()))?;
    Experiment::from_json(&value)
}

/// Store a validated experiment definition. Refuses to overwrite a live
/// (active or concluded) experiment unless `skip_launched` is set.
pub fn load<S: KvStore + ?Sized>(store: &S, definition: &Value, skip_launched: bool) -> Result<Experiment> {
    crate::kv::transaction(store, false, |map| {
        let experiment = Experiment::from_json(definition)?;

        if !skip_launched {
            let active: Vec<String> = map.get_or("active-experiments", Vec::new())?;
            let concluded: Vec<String> = map.get_or("concluded-experiments", Vec::new())?;
            if active.contains(&experiment.id) || concluded.contains(&experiment.id) {
                return Err(JacquardError::IllegalTransition(format!(
                    "experiment {:?} is live, refusing to overwrite without skip_launched",
                    experiment.id
                )));
            }
        }

        map.set(&experiment_key(&experiment.id), &experiment.to_json())?;
        Ok(experiment)
    })
}

/// `draft -> active`: allocates buckets via [`release::release_within`],
/// stamps `launched`, and appends to the active-experiments list, all in
/// one transaction.
pub fn launch<S, R>(store: &S, id: &str, now: DateTime<Utc>, relaunch: bool, rng: &mut R) -> Result<Experiment>
where
    S: KvStore + ?Sized,
    R: Rng + ?Sized,
{
    odm::transaction::<_, Bucket, _, _>(store, |session| {
        let mut experiment = read_experiment(session, id)?;

        let mut active: Vec<String> = session.raw().get_or("active-experiments", Vec::new())?;

        if active.contains(&experiment.id) {
            return Err(JacquardError::IllegalTransition(format!(
                "experiment {:?} is already active",
                experiment.id
            )));
        }

        if experiment.concluded.is_some() {
            if !relaunch {
                return Err(JacquardError::IllegalTransition(format!(
                    "experiment {:?} has already concluded; pass relaunch to relaunch it",
                    experiment.id
                )));
            }
            experiment.launched = None;
            experiment.concluded = None;

            let mut concluded_list: Vec<String> = session.raw().get_or("concluded-experiments", Vec::new())?;
            concluded_list.retain(|existing| existing != &experiment.id);
            session.raw().set("concluded-experiments", &concluded_list)?;
        }

        let context = ConstraintContext { era_start_date: now };
        let specialised_constraints = experiment.constraints.specialise(&context);

        let branch_count = experiment.branches.len() as f64;
        let default_percent = (100.0 / branch_count).floor();

        let allocations: Vec<BranchAllocation> = experiment
            .branches
            .iter()
            .map(|b| {
                let percent = b.percent.unwrap_or(default_percent);
                let n_buckets = ((NUM_BUCKETS as f64) * percent / 100.0).floor() as usize;
                BranchAllocation {
                    branch_id: b.id.clone(),
                    n_buckets,
                    settings: b.settings.clone(),
                }
            })
            .collect();

        release::release_within(session, &experiment.id, &specialised_constraints, &allocations, rng)?;

        experiment.launched = Some(now);
        active.push(experiment.id.clone());

        log::info!("launched experiment {:?}", experiment.id);
        session.raw().set("active-experiments", &active)?;
        session.raw().set(&experiment_key(&experiment.id), &experiment.to_json())?;

        Ok(experiment)
    })
}

/// `active -> concluded`: retracts the experiment's buckets, optionally
/// promotes one branch's settings into `defaults`, stamps `concluded`,
/// and moves the id from the active to the concluded list.
pub fn conclude<S: KvStore + ?Sized>(
    store: &S,
    id: &str,
    promote_branch: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Experiment> {
    odm::transaction::<_, Bucket, _, _>(store, |session| {
        let mut experiment = read_experiment(session, id)?;

        let mut active: Vec<String> = session.raw().get_or("active-experiments", Vec::new())?;

        if !active.contains(&experiment.id) {
            let message = if experiment.launched.is_none() {
                format!("experiment {:?} was never launched", experiment.id)
            } else {
                format!(
                    "experiment {:?} already concluded at {:?}",
                    experiment.id, experiment.concluded
                )
            };
            return Err(JacquardError::IllegalTransition(message));
        }

        let branch_ids: Vec<String> = experiment.branches.iter().map(|b| b.id.clone()).collect();
        release::close_within(session, &experiment.id, &branch_ids)?;

        if let Some(branch_id) = promote_branch {
            let branch = experiment.branch(branch_id)?;
            let mut defaults: Map<String, Value> = session.raw().get_or("defaults", Map::new())?;
            for (k, v) in &branch.settings {
                defaults.insert(k.clone(), v.clone());
            }
            session.raw().set("defaults", &defaults)?;
        }

        active.retain(|existing| existing != &experiment.id);
        let mut concluded_list: Vec<String> = session.raw().get_or("concluded-experiments", Vec::new())?;
        concluded_list.push(experiment.id.clone());

        experiment.concluded = Some(now);

        log::info!("concluded experiment {:?}", experiment.id);
        session.raw().set("active-experiments", &active)?;
        session.raw().set("concluded-experiments", &concluded_list)?;
        session.raw().set(&experiment_key(&experiment.id), &experiment.to_json())?;

        Ok(experiment)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryStore;
    use rand::rngs::mock::StepRng;

    fn definition(id: &str, branch_count: usize) -> Value {
        let branches: Vec<Value> = (0..branch_count)
            .map(|i| {
                serde_json::json!({
                    "id": format!("branch-{i}"),
                    "settings": {"color": format!("color-{i}")},
                })
            })
            .collect();
        serde_json::json!({"id": id, "branches": branches})
    }

    #[test]
    fn launch_then_conclude_cycle() {
        let store = MemoryStore::new();
        let mut rng = StepRng::new(0, 1);
        let now: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();

        load(&store, &definition("exp-a", 2), false).unwrap();
        let launched = launch(&store, "exp-a", now, false, &mut rng).unwrap();
        assert!(launched.launched.is_some());

        let concluded = conclude(&store, "exp-a", Some("branch-0"), now).unwrap();
        assert!(concluded.concluded.is_some());
    }

    #[test]
    fn cannot_launch_twice() {
        let store = MemoryStore::new();
        let mut rng = StepRng::new(0, 1);
        let now: DateTime<Utc> = "2020-01-01T00:00:00Z".parse().unwrap();

        load(&store, &definition("exp-a", 2), false).unwrap();
        launch(&store, "exp-a", now, false, &mut rng).unwrap();
        let result = launch(&store, "exp-a", now, false, &mut rng);
        assert!(matches!(result, Err(JacquardError::IllegalTransition(_))));
    }

    #[test]
    fn cannot_conclude_a_never_launched_experiment() {
        let store = MemoryStore::new();
        load(&store, &definition("exp-a", 2), false).unwrap();
        let result = conclude(&store, "exp-a", None, "2020-01-01T00:00:00Z".parse().unwrap());
        assert!(matches!(result, Err(JacquardError::IllegalTransition(_))));
    }

    #[test]
    fn empty_branches_are_rejected() {
        let value = serde_json::json!({"id": "exp-a", "branches": []});
        assert!(Experiment::from_json(&value).is_err());
    }

    #[test]
    fn duplicate_branch_ids_are_rejected() {
        let value = serde_json::json!({
            "id": "exp-a",
            "branches": [{"id": "a"}, {"id": "a"}],
        });
        assert!(Experiment::from_json(&value).is_err());
    }
}
