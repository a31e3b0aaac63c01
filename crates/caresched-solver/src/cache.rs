//! Per-day solution cache.
//!
//! The cache records, for every window obligation, each (iteration, day)
//! whose persisted subproblem result satisfied it. From iteration three on
//! a matching MILP recombines the best cached day per calendar day into a
//! candidate final result; the cache also short-circuits day subproblems
//! whose request set was already solved in an earlier iteration.
//!
//! Only (iteration, day) pairs live in memory — matched results are
//! exhumed from the persisted `subproblem_day_<d>_result.json` files, which
//! keeps the artifacts on disk the single source of truth.

use crate::milp::{LinearExpr, Model, Relation, SolveLimits, SolveOutcome, VarId};
use crate::persist::{read_json, OutputLayout, PersistError};
use caresched_core::{
    DayName, FinalResult, IterationName, MasterInstance, MasterResult, SubproblemResult,
    WindowRequest,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One cached per-day solution: which iteration solved which day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IterationDay {
    pub iteration: IterationName,
    pub day: DayName,
}

/// For each window obligation, every (iteration, day) that satisfied it.
pub type Cache = BTreeMap<WindowRequest, Vec<IterationDay>>;

/// The matching's output: the iteration chosen for each cached day.
pub type CacheMatch = BTreeMap<DayName, IterationName>;

// ============================================================================
// Recording
// ============================================================================

/// Whether all `requests` already appear together under `day` in one
/// single prior iteration (so re-recording them would be redundant).
fn request_set_already_present(
    cache: &Cache,
    requests: &BTreeSet<WindowRequest>,
    day: DayName,
) -> bool {
    let mut candidates: Option<BTreeSet<IterationDay>> = None;
    for request in requests {
        let Some(entries) = cache.get(request) else {
            return false;
        };
        let narrowed: BTreeSet<IterationDay> = match &candidates {
            None => entries.iter().filter(|e| e.day == day).copied().collect(),
            Some(current) => {
                current.iter().filter(|c| entries.contains(c)).copied().collect()
            }
        };
        if narrowed.is_empty() {
            return false;
        }
        candidates = Some(narrowed);
    }
    candidates.is_some()
}

/// Add one iteration's final result to the cache. Growth is monotone; no
/// (iteration, day) tuple is inserted twice, and a day whose full window
/// set is already covered by a single earlier iteration is suppressed.
pub fn record_final_result(
    cache: &mut Cache,
    instance: &MasterInstance,
    final_result: &FinalResult,
    iteration: IterationName,
) {
    for (day_name, placements) in &final_result.scheduled {
        let mut requests_to_add: BTreeSet<WindowRequest> = BTreeSet::new();
        for placement in placements {
            let Some(patient) = instance.patients.get(&placement.patient) else {
                continue;
            };
            let Some(windows) = patient.requests.get(&placement.service) else {
                continue;
            };
            for window in windows {
                if window.contains(*day_name) {
                    requests_to_add.insert(WindowRequest {
                        patient: placement.patient.clone(),
                        service: placement.service.clone(),
                        window: *window,
                    });
                }
            }
        }

        if requests_to_add.is_empty()
            || request_set_already_present(cache, &requests_to_add, *day_name)
        {
            continue;
        }
        for request in requests_to_add {
            cache
                .entry(request)
                .or_default()
                .push(IterationDay { iteration, day: *day_name });
        }
    }
}

// ============================================================================
// Matching model
// ============================================================================

/// Matching MILP over the cached (iteration, day) pairs: choose exactly one
/// iteration per cached day, maximize the weighted satisfied windows.
pub struct CacheMatchingModel {
    model: Model,
    choose_vars: Vec<(IterationDay, VarId)>,
}

impl CacheMatchingModel {
    pub fn build(instance: &MasterInstance, cache: &Cache) -> Self {
        let mut model = Model::new();

        let choice_index: BTreeSet<IterationDay> =
            cache.values().flatten().copied().collect();
        let choose_vars: Vec<(IterationDay, VarId)> =
            choice_index.into_iter().map(|entry| (entry, model.binary())).collect();
        let choose_of = |entry: &IterationDay| -> VarId {
            choose_vars
                .iter()
                .find(|(candidate, _)| candidate == entry)
                .map(|(_, var)| *var)
                .expect("choice index covers every cache entry")
        };

        let mut objective = LinearExpr::new();
        for (request, entries) in cache {
            let window_var = model.binary();
            // A satisfied window needs at least one of its cached days.
            let mut link = LinearExpr::new().term(window_var, -1);
            for entry in entries {
                link.add_term(choose_of(entry), 1);
            }
            model.constrain(link, Relation::Ge, 0);

            let duration = instance
                .services
                .get(&request.service)
                .map_or(0, |service| i64::from(service.duration));
            let priority = instance
                .patients
                .get(&request.patient)
                .map_or(0, |patient| i64::from(patient.priority));
            objective.add_term(window_var, duration * priority);
        }

        let day_names: BTreeSet<DayName> =
            choose_vars.iter().map(|(entry, _)| entry.day).collect();
        for day in day_names {
            let mut expr = LinearExpr::new();
            for (entry, var) in &choose_vars {
                if entry.day == day {
                    expr.add_term(*var, 1);
                }
            }
            model.constrain(expr, Relation::Eq, 1);
        }

        model.maximize(objective);
        Self { model, choose_vars }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> CacheMatch {
        self.choose_vars
            .iter()
            .filter(|(_, var)| outcome.is_set(*var))
            .map(|(entry, _)| (entry.day, entry.iteration))
            .collect()
    }

    pub fn size(&self) -> (usize, usize) {
        (self.model.var_count(), self.model.constraint_count())
    }
}

// ============================================================================
// Exhumation and fixing
// ============================================================================

/// Assemble the matching's candidate final result by re-reading each
/// matched day's persisted subproblem result.
pub fn exhume_final_result(
    matching: &CacheMatch,
    layout: &OutputLayout,
) -> Result<FinalResult, PersistError> {
    let mut final_result = FinalResult::default();
    for (day, iteration) in matching {
        let result: SubproblemResult = read_json(&layout.subproblem_result(*iteration, *day))?;
        final_result.scheduled.insert(*day, result.scheduled().to_vec());
    }
    Ok(final_result)
}

/// Make an exhumed result coherent: obligations satisfied more than once
/// keep their first occurrence, unsatisfied obligations go to `rejected`.
pub fn fix_cache_final_result(instance: &MasterInstance, final_result: &mut FinalResult) {
    for (patient_name, patient) in &instance.patients {
        for (service_name, windows) in &patient.requests {
            for window in windows {
                let mut satisfied = false;
                for day in window.days() {
                    let Some(placements) = final_result.scheduled.get_mut(&day) else {
                        continue;
                    };
                    let position = placements.iter().position(|p| {
                        &p.patient == patient_name && &p.service == service_name
                    });
                    if let Some(position) = position {
                        if satisfied {
                            placements.remove(position);
                        }
                        satisfied = true;
                    }
                }
            }
        }
    }

    for (patient_name, patient) in &instance.patients {
        for (service_name, windows) in &patient.requests {
            for window in windows {
                let satisfied = window.days().any(|day| {
                    final_result.scheduled.get(&day).is_some_and(|placements| {
                        placements.iter().any(|p| {
                            &p.patient == patient_name && &p.service == service_name
                        })
                    })
                });
                if !satisfied {
                    let request = WindowRequest {
                        patient: patient_name.clone(),
                        service: service_name.clone(),
                        window: *window,
                    };
                    if !final_result.rejected.contains(&request) {
                        final_result.rejected.push(request);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Day reuse
// ============================================================================

/// Days of the current master result whose full request set was already
/// solved together in some earlier iteration; the most recent such
/// iteration wins.
pub fn previous_cache_day_iterations(
    cache: &Cache,
    master_result: &MasterResult,
    instance: &MasterInstance,
) -> BTreeMap<DayName, IterationName> {
    let mut reusable = BTreeMap::new();

    for day in master_result.day_names() {
        let requests = master_result.slim_requests_on(day);
        let mut obligations: BTreeSet<WindowRequest> = BTreeSet::new();
        for request in &requests {
            let Some(windows) = instance
                .patients
                .get(&request.patient)
                .and_then(|p| p.requests.get(&request.service))
            else {
                continue;
            };
            for window in windows {
                if window.contains(day) {
                    obligations.insert(WindowRequest {
                        patient: request.patient.clone(),
                        service: request.service.clone(),
                        window: *window,
                    });
                }
            }
        }
        if obligations.is_empty() {
            continue;
        }

        let mut candidates: Option<BTreeSet<IterationName>> = None;
        let mut complete = true;
        for obligation in &obligations {
            let Some(entries) = cache.get(obligation) else {
                complete = false;
                break;
            };
            let iterations: BTreeSet<IterationName> =
                entries.iter().filter(|e| e.day == day).map(|e| e.iteration).collect();
            let narrowed = match &candidates {
                None => iterations,
                Some(current) => current.intersection(&iterations).copied().collect(),
            };
            if narrowed.is_empty() {
                complete = false;
                break;
            }
            candidates = Some(narrowed);
        }

        if complete {
            if let Some(iteration) = candidates.and_then(|c| c.last().copied()) {
                debug!(day, iteration, "day already solved in cache");
                reusable.insert(day, iteration);
            }
        }
    }

    reusable
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresched_core::{
        Day, MasterPatient, Operator, Placement, Service, SlimMasterResult, SlimRequest, Window,
    };
    use pretty_assertions::assert_eq;

    fn two_day_instance() -> MasterInstance {
        let mut instance = MasterInstance::default();
        instance
            .services
            .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });
        for day_name in 1..=2 {
            let mut day = Day::default();
            day.add_operator("cu00", "op00", Operator { start: 0, duration: 10 });
            instance.days.insert(day_name, day);
        }
        for name in ["pat00", "pat01"] {
            let mut patient = MasterPatient::new(1);
            patient.add_request("srv00", Window::new(1, 2));
            instance.patients.insert(name.into(), patient);
        }
        instance
    }

    fn placement(patient: &str, time: i32) -> Placement {
        Placement {
            patient: patient.into(),
            service: "srv00".into(),
            operator: "op00".into(),
            time,
        }
    }

    fn final_result_on_day(day: DayName, patients: &[&str]) -> FinalResult {
        let mut result = FinalResult::default();
        result.scheduled.insert(
            day,
            patients.iter().enumerate().map(|(i, p)| placement(p, 4 * i as i32)).collect(),
        );
        result
    }

    #[test]
    fn recording_is_monotone_and_suppresses_duplicates() {
        let instance = two_day_instance();
        let mut cache = Cache::new();

        record_final_result(&mut cache, &instance, &final_result_on_day(1, &["pat00"]), 1);
        assert_eq!(cache.len(), 1);
        let key = WindowRequest {
            patient: "pat00".into(),
            service: "srv00".into(),
            window: Window::new(1, 2),
        };
        assert_eq!(cache[&key], vec![IterationDay { iteration: 1, day: 1 }]);

        // The same request set on the same day is suppressed...
        record_final_result(&mut cache, &instance, &final_result_on_day(1, &["pat00"]), 2);
        assert_eq!(cache[&key].len(), 1);

        // ...a different day or a different set is not.
        record_final_result(&mut cache, &instance, &final_result_on_day(2, &["pat00"]), 2);
        record_final_result(
            &mut cache,
            &instance,
            &final_result_on_day(1, &["pat00", "pat01"]),
            3,
        );
        assert_eq!(cache[&key].len(), 3);
    }

    #[test]
    fn matching_picks_one_iteration_per_day() {
        let instance = two_day_instance();
        let mut cache = Cache::new();
        record_final_result(&mut cache, &instance, &final_result_on_day(1, &["pat00"]), 1);
        record_final_result(
            &mut cache,
            &instance,
            &final_result_on_day(1, &["pat00", "pat01"]),
            2,
        );

        let model = CacheMatchingModel::build(&instance, &cache);
        let outcome = model.solve(&SolveLimits::seconds(10.0));
        let matching = model.extract(&outcome);
        // Iteration 2 satisfies both windows on day 1.
        assert_eq!(matching, BTreeMap::from([(1, 2)]));
        assert_eq!(outcome.objective, Some(8));
    }

    #[test]
    fn fixing_removes_double_satisfaction_and_fills_rejected() {
        let instance = two_day_instance();
        let mut result = final_result_on_day(1, &["pat00"]);
        result.scheduled.insert(2, vec![placement("pat00", 0)]);

        fix_cache_final_result(&instance, &mut result);
        // Window [1,2] of pat00 keeps only the day-1 placement; pat01 is
        // nowhere and lands in rejected.
        assert_eq!(result.scheduled[&1].len(), 1);
        assert_eq!(result.scheduled[&2].len(), 0);
        assert_eq!(
            result.rejected,
            vec![WindowRequest {
                patient: "pat01".into(),
                service: "srv00".into(),
                window: Window::new(1, 2),
            }]
        );
    }

    #[test]
    fn reuse_finds_day_solved_in_prior_iteration() {
        let instance = two_day_instance();
        let mut cache = Cache::new();
        record_final_result(
            &mut cache,
            &instance,
            &final_result_on_day(1, &["pat00", "pat01"]),
            1,
        );

        let mut master = SlimMasterResult::default();
        master.scheduled.insert(
            1,
            vec![
                SlimRequest { patient: "pat00".into(), service: "srv00".into() },
                SlimRequest { patient: "pat01".into(), service: "srv00".into() },
            ],
        );
        let reusable = previous_cache_day_iterations(
            &cache,
            &MasterResult::Slim(master.clone()),
            &instance,
        );
        assert_eq!(reusable, BTreeMap::from([(1, 1)]));

        // A larger request set than anything cached is not reusable.
        let mut larger = master;
        larger.scheduled.insert(
            2,
            vec![SlimRequest { patient: "pat00".into(), service: "srv00".into() }],
        );
        let reusable = previous_cache_day_iterations(
            &cache,
            &MasterResult::Slim(larger),
            &instance,
        );
        assert!(!reusable.contains_key(&2));
    }
}
