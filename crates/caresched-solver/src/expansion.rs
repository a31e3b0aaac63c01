//! Core expansion: replicate a core across renamings and subsuming days.
//!
//! A core proves a component combination unpackable. The same proof holds
//! after renaming patients, services or operators (when the respective
//! expansion flag anonymises them), and on any day whose care units
//! subsume the core's day. Renamings are enumerated as maximum bipartite
//! matchings between core components and the day's possible master
//! requests, banning each found matching until none is complete or the
//! per-core budget runs out.

use crate::config::SolverConfig;
use crate::cores::Cores;
use crate::milp::{LinearExpr, Model, Relation, SolveLimits, SolveOutcome, SolveStatus, VarId};
use crate::subsumption::{subsuming_days, Subsumptions};
use caresched_core::{
    CareUnitName, Core, DayName, FatRequest, MasterInstance, RequestRef, Service, ServiceName,
    SlimRequest,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// ============================================================================
// Possible master requests per day
// ============================================================================

/// Every fat request the master could emit on each day.
pub fn all_possible_fat_requests(instance: &MasterInstance) -> BTreeMap<DayName, Vec<FatRequest>> {
    let mut possible: BTreeMap<DayName, BTreeSet<FatRequest>> = BTreeMap::new();
    for (patient_name, patient) in &instance.patients {
        for (service_name, windows) in &patient.requests {
            let Some(care_unit) = instance.care_unit_of(service_name) else {
                continue;
            };
            for window in windows {
                for day in window.days() {
                    let Some(operators) =
                        instance.days.get(&day).and_then(|d| d.care_unit(care_unit))
                    else {
                        continue;
                    };
                    for operator in operators.keys() {
                        possible.entry(day).or_default().insert(FatRequest {
                            patient: patient_name.clone(),
                            service: service_name.clone(),
                            operator: operator.clone(),
                        });
                    }
                }
            }
        }
    }
    possible
        .into_iter()
        .map(|(day, requests)| (day, requests.into_iter().collect()))
        .collect()
}

/// Every slim request the master could emit on each day.
pub fn all_possible_slim_requests(
    instance: &MasterInstance,
) -> BTreeMap<DayName, Vec<SlimRequest>> {
    let mut possible: BTreeMap<DayName, BTreeSet<SlimRequest>> = BTreeMap::new();
    for (patient_name, patient) in &instance.patients {
        for (service_name, windows) in &patient.requests {
            for window in windows {
                for day in window.days() {
                    possible.entry(day).or_default().insert(SlimRequest {
                        patient: patient_name.clone(),
                        service: service_name.clone(),
                    });
                }
            }
        }
    }
    possible
        .into_iter()
        .map(|(day, requests)| (day, requests.into_iter().collect()))
        .collect()
}

/// Fat or slim flavor of the per-day possible requests.
pub enum AllPossibleRequests {
    Fat(BTreeMap<DayName, Vec<FatRequest>>),
    Slim(BTreeMap<DayName, Vec<SlimRequest>>),
}

impl AllPossibleRequests {
    pub fn for_structure(instance: &MasterInstance, master_is_fat: bool) -> Self {
        if master_is_fat {
            AllPossibleRequests::Fat(all_possible_fat_requests(instance))
        } else {
            AllPossibleRequests::Slim(all_possible_slim_requests(instance))
        }
    }
}

// ============================================================================
// Maximum matching model
// ============================================================================

/// Maximum bipartite matching over component→request arcs with
/// name-consistency cuts; previously found matchings are banned so repeated
/// solves enumerate distinct renamings.
pub struct MatchingModel<C> {
    model: Model,
    arc_vars: Vec<(C, C, VarId)>,
}

impl<C: RequestRef + Clone + Ord> MatchingModel<C> {
    pub fn build(arcs: &BTreeSet<(C, C)>) -> Self {
        let mut model = Model::new();
        let arc_vars: Vec<(C, C, VarId)> = arcs
            .iter()
            .map(|(source, destination)| (source.clone(), destination.clone(), model.binary()))
            .collect();

        let sources: BTreeSet<&C> = arc_vars.iter().map(|(s, _, _)| s).collect();
        for source in sources {
            let mut expr = LinearExpr::new();
            for (s, _, var) in &arc_vars {
                if s == source {
                    expr.add_term(*var, 1);
                }
            }
            model.constrain(expr, Relation::Le, 1);
        }
        let destinations: BTreeSet<&C> = arc_vars.iter().map(|(_, d, _)| d).collect();
        for destination in destinations {
            let mut expr = LinearExpr::new();
            for (_, d, var) in &arc_vars {
                if d == destination {
                    expr.add_term(*var, 1);
                }
            }
            model.constrain(expr, Relation::Le, 1);
        }

        // Two arcs whose sources share a patient (or an operator) must map
        // to destinations sharing it too.
        for i in 0..arc_vars.len() {
            for j in (i + 1)..arc_vars.len() {
                let (first_source, first_dest, first_var) = &arc_vars[i];
                let (second_source, second_dest, second_var) = &arc_vars[j];
                let patient_clash = first_source.patient() == second_source.patient()
                    && first_dest.patient() != second_dest.patient();
                let operator_clash = match (
                    first_source.operator(),
                    second_source.operator(),
                    first_dest.operator(),
                    second_dest.operator(),
                ) {
                    (Some(a), Some(b), Some(c), Some(d)) => a == b && c != d,
                    _ => false,
                };
                if patient_clash || operator_clash {
                    model.constrain(
                        LinearExpr::new().term(*first_var, 1).term(*second_var, 1),
                        Relation::Le,
                        1,
                    );
                }
            }
        }

        let mut objective = LinearExpr::new();
        for (_, _, var) in &arc_vars {
            objective.add_term(*var, 1);
        }
        model.maximize(objective);

        Self { model, arc_vars }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    /// The chosen arcs of a proven-optimal outcome; empty otherwise.
    pub fn matching(&self, outcome: &SolveOutcome) -> Vec<(C, C)> {
        if outcome.status != SolveStatus::Optimal {
            return Vec::new();
        }
        self.arc_vars
            .iter()
            .filter(|(_, _, var)| outcome.is_set(*var))
            .map(|(source, destination, _)| (source.clone(), destination.clone()))
            .collect()
    }

    /// Forbid one matching from reappearing.
    pub fn ban(&mut self, matching: &[(C, C)]) {
        let mut expr = LinearExpr::new();
        for (source, destination, var) in &self.arc_vars {
            if matching.iter().any(|(s, d)| s == source && d == destination) {
                expr.add_term(*var, 1);
            }
        }
        self.model.constrain(expr, Relation::Le, matching.len() as i64 - 1);
    }
}

// ============================================================================
// Expansion
// ============================================================================

fn expansion_arcs<C: RequestRef + Clone + Ord>(
    core: &Core<C>,
    possible: &[C],
    services: &BTreeMap<ServiceName, Service>,
    config: &SolverConfig,
) -> BTreeSet<(C, C)> {
    let mut arcs = BTreeSet::new();
    for component in &core.components {
        let Some(component_service) = services.get(component.service()) else {
            continue;
        };
        for request in possible {
            let Some(request_service) = services.get(request.service()) else {
                continue;
            };
            if component_service.care_unit != request_service.care_unit {
                continue;
            }
            if component_service.duration > request_service.duration {
                continue;
            }
            if !config.core_patient_expansion && component.patient() != request.patient() {
                continue;
            }
            if !config.core_service_expansion && component.service() != request.service() {
                continue;
            }
            if !config.core_operator_expansion && component.operator() != request.operator() {
                continue;
            }
            arcs.insert((component.clone(), request.clone()));
        }
    }
    arcs
}

/// Rename a core through a matching; unmatched entries are copied as-is.
fn core_from_matching<C: Clone + PartialEq>(
    core: &Core<C>,
    matching: &[(C, C)],
    day: DayName,
) -> Core<C> {
    let rename = |entry: &C| -> C {
        matching
            .iter()
            .find(|(source, _)| source == entry)
            .map_or_else(|| entry.clone(), |(_, destination)| destination.clone())
    };
    Core {
        days: vec![day],
        reason: core.reason.iter().map(rename).collect(),
        components: core.components.iter().map(rename).collect(),
    }
}

fn expand_core_list<C: RequestRef + Clone + Ord>(
    cores: &[Core<C>],
    possible: &BTreeMap<DayName, Vec<C>>,
    services: &BTreeMap<ServiceName, Service>,
    config: &SolverConfig,
    subsumptions: Option<&Subsumptions>,
) -> Vec<Core<C>> {
    let limits = config.core_expansion.limits();
    let mut expanded = Vec::new();

    for core in cores {
        let mut target_days: BTreeSet<DayName> = core.days.iter().copied().collect();
        if config.core_day_expansion {
            if let Some(subsumptions) = subsumptions {
                let affected: BTreeSet<CareUnitName> = core
                    .components
                    .iter()
                    .filter_map(|c| services.get(c.service()))
                    .map(|s| s.care_unit.clone())
                    .collect();
                for day in &core.days {
                    target_days.extend(subsuming_days(subsumptions, &affected, *day));
                }
            }
        }

        for day in target_days {
            let Some(day_requests) = possible.get(&day) else {
                continue;
            };
            let arcs = expansion_arcs(core, day_requests, services, config);
            if arcs.is_empty() {
                continue;
            }
            let mut matching_model = MatchingModel::build(&arcs);

            let mut expansions = 0u32;
            while expansions < config.max_single_core_expansion {
                let outcome = matching_model.solve(&limits);
                let matching = matching_model.matching(&outcome);
                if matching.len() != core.components.len() {
                    break;
                }
                expanded.push(core_from_matching(core, &matching, day));
                matching_model.ban(&matching);
                expansions += 1;
            }
            debug!(day, expansions, "core expansion on day finished");
        }
    }

    expanded
}

/// Expand every core per the configured anonymisation and day flags.
pub fn expand_cores(
    cores: &Cores,
    possible: &AllPossibleRequests,
    services: &BTreeMap<ServiceName, Service>,
    config: &SolverConfig,
    subsumptions: Option<&Subsumptions>,
) -> Cores {
    match (cores, possible) {
        (Cores::Fat(cores), AllPossibleRequests::Fat(possible)) => {
            Cores::Fat(expand_core_list(cores, possible, services, config, subsumptions))
        }
        (Cores::Slim(cores), AllPossibleRequests::Slim(possible)) => {
            Cores::Slim(expand_core_list(cores, possible, services, config, subsumptions))
        }
        // Flavors never mix within one run.
        _ => match cores {
            Cores::Fat(_) => Cores::Fat(Vec::new()),
            Cores::Slim(_) => Cores::Slim(Vec::new()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use pretty_assertions::assert_eq;

    fn slim(patient: &str, service: &str) -> SlimRequest {
        SlimRequest { patient: patient.into(), service: service.into() }
    }

    fn services_one_unit() -> BTreeMap<ServiceName, Service> {
        let mut services = BTreeMap::new();
        services.insert("srv00".to_string(), Service { care_unit: "cu00".into(), duration: 4 });
        services
    }

    #[test]
    fn identity_matching_is_enumerated_first_or_last() {
        let core = Core {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![slim("pat00", "srv00"), slim("pat01", "srv00")],
        };
        let possible: BTreeMap<DayName, Vec<SlimRequest>> = BTreeMap::from([(
            1,
            vec![slim("pat00", "srv00"), slim("pat01", "srv00"), slim("pat02", "srv00")],
        )]);
        let config = SolverConfig {
            core_patient_expansion: true,
            max_single_core_expansion: 50,
            ..SolverConfig::default()
        };

        let expanded =
            expand_core_list(&[core], &possible, &services_one_unit(), &config, None);
        // Ordered injections of 2 components into 3 patients: 6 matchings.
        assert_eq!(expanded.len(), 6);
        for core in &expanded {
            assert_eq!(core.components.len(), 2);
            assert_eq!(core.days, vec![1]);
        }
    }

    #[test]
    fn without_flags_only_identity_matches() {
        let core = Core {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![slim("pat00", "srv00"), slim("pat01", "srv00")],
        };
        let possible: BTreeMap<DayName, Vec<SlimRequest>> = BTreeMap::from([(
            1,
            vec![slim("pat00", "srv00"), slim("pat01", "srv00"), slim("pat02", "srv00")],
        )]);
        let config =
            SolverConfig { max_single_core_expansion: 50, ..SolverConfig::default() };

        let expanded =
            expand_core_list(&[core.clone()], &possible, &services_one_unit(), &config, None);
        assert_eq!(expanded.len(), 1);
        assert!(expanded[0].is_equivalent(&core));
    }

    #[test]
    fn name_consistency_keeps_patient_blocks_together() {
        // Components of one patient must map onto a single patient.
        let mut services = services_one_unit();
        services.insert("srv01".to_string(), Service { care_unit: "cu00".into(), duration: 4 });
        let core = Core {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![slim("pat00", "srv00"), slim("pat00", "srv01")],
        };
        let possible: BTreeMap<DayName, Vec<SlimRequest>> = BTreeMap::from([(
            1,
            vec![
                slim("pat00", "srv00"),
                slim("pat00", "srv01"),
                slim("pat01", "srv00"),
                slim("pat01", "srv01"),
            ],
        )]);
        let config = SolverConfig {
            core_patient_expansion: true,
            max_single_core_expansion: 50,
            ..SolverConfig::default()
        };

        let expanded = expand_core_list(&[core], &possible, &services, &config, None);
        assert_eq!(expanded.len(), 2);
        for core in &expanded {
            let patients: BTreeSet<&str> =
                core.components.iter().map(|c| c.patient.as_str()).collect();
            assert_eq!(patients.len(), 1, "components leaked across patients: {core:?}");
        }
    }

    #[test]
    fn shorter_services_may_take_longer_slots_but_not_conversely() {
        let mut services = services_one_unit();
        services.insert("srv01".to_string(), Service { care_unit: "cu00".into(), duration: 6 });
        let core = Core {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![slim("pat00", "srv00")],
        };
        let possible: BTreeMap<DayName, Vec<SlimRequest>> =
            BTreeMap::from([(1, vec![slim("pat00", "srv00"), slim("pat00", "srv01")])]);
        let config = SolverConfig {
            core_service_expansion: true,
            max_single_core_expansion: 50,
            ..SolverConfig::default()
        };

        let expanded = expand_core_list(&[core], &possible, &services, &config, None);
        let targets: BTreeSet<&str> = expanded
            .iter()
            .map(|core| core.components[0].service.as_str())
            .collect();
        assert_eq!(targets, BTreeSet::from(["srv00", "srv01"]));

        // A duration-6 component cannot land on a duration-4 request.
        let long_core = Core {
            days: vec![1],
            reason: vec![slim("pat00", "srv01")],
            components: vec![slim("pat00", "srv01")],
        };
        let expanded = expand_core_list(&[long_core], &possible, &services, &config, None);
        let targets: BTreeSet<&str> = expanded
            .iter()
            .map(|core| core.components[0].service.as_str())
            .collect();
        assert_eq!(targets, BTreeSet::from(["srv01"]));
    }
}
