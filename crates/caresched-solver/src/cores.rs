//! Core extraction pipeline: generalist → basic → reduced → pruned.
//!
//! A core is a no-good cut produced from a day the packing subproblem could
//! not fully satisfy. Later stages shrink the component set — reduction
//! keeps only components connected to the reason through shared patients or
//! operators, pruning asks the subproblem oracle for the smallest prefix
//! (under a heuristic distance ordering) that is still infeasible.

use crate::milp::SolveLimits;
use crate::subproblem::is_fully_satisfiable;
use caresched_core::{
    Core, DayName, FatCore, FatMasterResult, FatRequest, FatSubproblemInstance,
    FatSubproblemPatient, FatSubproblemResult, Placement, Service, ServiceName, ServiceOperator,
    SlimCore, SlimRequest, SlimSubproblemInstance, SlimSubproblemPatient, SlimSubproblemResult,
    SubproblemInstance,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// A homogeneous list of cores, fat or slim per the master flavor.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Cores {
    Fat(Vec<FatCore>),
    Slim(Vec<SlimCore>),
}

impl Cores {
    pub fn len(&self) -> usize {
        match self {
            Cores::Fat(cores) => cores.len(),
            Cores::Slim(cores) => cores.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check(&self, instance: &caresched_core::MasterInstance) -> Vec<String> {
        match self {
            Cores::Fat(cores) => caresched_core::check::check_cores(instance, cores),
            Cores::Slim(cores) => caresched_core::check::check_cores(instance, cores),
        }
    }

    /// Set-union with another list of the same flavor, dropping equivalent
    /// cores (same day set, same component set).
    pub fn aggregate(&self, other: &Cores) -> Cores {
        match (self, other) {
            (Cores::Fat(a), Cores::Fat(b)) => Cores::Fat(aggregate_core_lists(a, b)),
            (Cores::Slim(a), Cores::Slim(b)) => Cores::Slim(aggregate_core_lists(a, b)),
            // Flavors never mix within one run.
            (a, _) => a.clone(),
        }
    }
}

/// One day's rejected and scheduled requests, reduced to core components.
#[derive(Clone, Debug)]
pub struct DayComponents<C> {
    pub day: DayName,
    pub rejected: Vec<C>,
    pub scheduled: Vec<C>,
}

impl DayComponents<FatRequest> {
    pub fn from_fat(day: DayName, result: &FatSubproblemResult) -> Self {
        Self {
            day,
            rejected: result.rejected.clone(),
            scheduled: result.scheduled.iter().cloned().map(FatRequest::from).collect(),
        }
    }
}

impl DayComponents<SlimRequest> {
    pub fn from_slim(day: DayName, result: &SlimSubproblemResult) -> Self {
        Self {
            day,
            rejected: result.rejected.clone(),
            scheduled: result.scheduled.iter().cloned().map(SlimRequest::from).collect(),
        }
    }
}

// ============================================================================
// Generalist and basic cores
// ============================================================================

/// One core per rejected day: reason = all rejections, components = the
/// whole day.
pub fn generalist_cores<C: Clone + Ord>(days: &[DayComponents<C>]) -> Vec<Core<C>> {
    let mut cores = Vec::new();
    for day in days {
        if day.rejected.is_empty() {
            continue;
        }
        let mut core = Core::new(day.day);
        core.reason = day.rejected.clone();
        core.components = day.rejected.clone();
        core.components.extend(day.scheduled.iter().cloned());
        core.components.sort();
        cores.push(core);
    }
    cores
}

/// One core per rejected request: reason = that request, components = the
/// request plus everything scheduled on its day.
pub fn basic_cores<C: Clone + Ord>(days: &[DayComponents<C>]) -> Vec<Core<C>> {
    let mut cores = Vec::new();
    for day in days {
        for rejected in &day.rejected {
            let mut core = Core::new(day.day);
            core.reason = vec![rejected.clone()];
            core.components = vec![rejected.clone()];
            core.components.extend(day.scheduled.iter().cloned());
            core.components.sort();
            cores.push(core);
        }
    }
    cores
}

// ============================================================================
// Reduced cores
// ============================================================================

/// Keep only components reachable from the reason through the sharing
/// graph: unrelated requests on the same day cannot have caused the
/// rejection.
pub fn reduce_cores<C, F>(mut cores: Vec<Core<C>>, linked: F) -> Vec<Core<C>>
where
    C: Clone + Ord,
    F: Fn(&C, &C) -> bool,
{
    for core in &mut cores {
        if core.components.is_empty() || core.reason.is_empty() {
            continue;
        }
        let mut to_visit: BTreeSet<C> = BTreeSet::new();
        let mut visited: BTreeSet<C> = BTreeSet::new();
        to_visit.insert(core.reason[0].clone());

        while let Some(request) = to_visit.pop_first() {
            visited.insert(request.clone());
            for other in &core.components {
                if visited.contains(other) || to_visit.contains(other) {
                    continue;
                }
                if linked(&request, other) {
                    to_visit.insert(other.clone());
                }
            }
        }

        core.components = visited.into_iter().collect();
    }
    cores
}

/// Fat linkage: shared patient or shared operator.
pub fn fat_link(a: &FatRequest, b: &FatRequest) -> bool {
    a.patient == b.patient || a.operator == b.operator
}

/// Slim linkage: shared patient or shared care unit.
pub fn slim_link(services: &BTreeMap<ServiceName, Service>) -> impl Fn(&SlimRequest, &SlimRequest) -> bool + '_ {
    |a, b| {
        a.patient == b.patient
            || services.get(&a.service).map(|s| &s.care_unit)
                == services.get(&b.service).map(|s| &s.care_unit)
    }
}

// ============================================================================
// Pruned cores
// ============================================================================

/// Options of the pruning stage, from the `core_pruning` phase config.
#[derive(Clone, Debug)]
pub struct PruneOptions {
    pub post_pruning_irreducibility: bool,
    pub use_redundant_operator_cut: bool,
    pub limits: SolveLimits,
}

/// BFS distance from the reason: shared operator weighs 1, shared patient
/// (without shared operator) weighs 10.
fn fat_components_metric(core: &FatCore) -> HashMap<FatRequest, i64> {
    let mut metric: HashMap<FatRequest, i64> = HashMap::new();
    let mut to_visit: BTreeSet<FatRequest> = BTreeSet::new();
    let mut visited: BTreeSet<FatRequest> = BTreeSet::new();

    to_visit.insert(core.reason[0].clone());
    metric.insert(core.reason[0].clone(), 0);

    while let Some(request) = to_visit.pop_first() {
        visited.insert(request.clone());
        for other in &core.components {
            if visited.contains(other) || to_visit.contains(other) {
                continue;
            }
            if request.operator == other.operator {
                metric.insert(other.clone(), metric[&request] + 1);
                to_visit.insert(other.clone());
            } else if request.patient == other.patient {
                metric.insert(other.clone(), metric[&request] + 10);
                to_visit.insert(other.clone());
            }
        }
    }
    metric
}

/// Slim flavor of the distance metric; operators are resolved through the
/// day's scheduled placements for finer grain, falling back to care units.
fn slim_components_metric(
    services: &BTreeMap<ServiceName, Service>,
    result: &SlimSubproblemResult,
    core: &SlimCore,
) -> HashMap<SlimRequest, i64> {
    let operator_of = |request: &SlimRequest| -> Option<&str> {
        result
            .scheduled
            .iter()
            .find(|p| p.patient == request.patient && p.service == request.service)
            .map(|p| p.operator.as_str())
    };

    let mut metric: HashMap<SlimRequest, i64> = HashMap::new();
    let mut to_visit: BTreeSet<SlimRequest> = BTreeSet::new();
    let mut visited: BTreeSet<SlimRequest> = BTreeSet::new();

    to_visit.insert(core.reason[0].clone());
    metric.insert(core.reason[0].clone(), 0);

    while let Some(request) = to_visit.pop_first() {
        visited.insert(request.clone());
        let operator = operator_of(&request);
        let care_unit = services.get(&request.service).map(|s| &s.care_unit);

        for other in &core.components {
            if visited.contains(other) || to_visit.contains(other) {
                continue;
            }
            match operator {
                Some(operator) => {
                    if operator_of(other) == Some(operator) {
                        metric.insert(other.clone(), metric[&request] + 1);
                        to_visit.insert(other.clone());
                    }
                }
                None => {
                    if services.get(&other.service).map(|s| &s.care_unit) == care_unit {
                        metric.insert(other.clone(), metric[&request] + 1);
                        to_visit.insert(other.clone());
                    }
                }
            }
            if !metric.contains_key(other) && request.patient == other.patient {
                metric.insert(other.clone(), metric[&request] + 10);
                to_visit.insert(other.clone());
            }
        }
    }
    metric
}

/// Binary search for the smallest still-infeasible prefix of the ordered
/// components, then the optional irreducibility sweep over a snapshot of
/// what the search kept.
fn prune_components<C, F>(
    sorted: &[C],
    reason_len: usize,
    options: &PruneOptions,
    mut satisfiable: F,
) -> Vec<C>
where
    C: Clone + PartialEq,
    F: FnMut(&[C]) -> bool,
{
    let mut start = 0usize;
    let mut end = sorted.len() - 1;
    let mut cursor = (end - start) / 2 + start;

    while end > start + 1 {
        if satisfiable(&sorted[..=cursor]) {
            start = cursor;
        } else {
            end = cursor;
        }
        cursor = (end - start) / 2 + start;
    }

    if end + 1 < reason_len {
        warn!(kept = end + 1, reason = reason_len, "pruned core smaller than its reason, keeping input");
        return sorted.to_vec();
    }
    let mut components: Vec<C> = sorted[..=end].to_vec();

    if options.post_pruning_irreducibility && components.len() > 2 {
        let snapshot = components.clone();
        for component in &snapshot[1..snapshot.len() - 1] {
            components.retain(|c| c != component);
            if satisfiable(&components) {
                components.push(component.clone());
            }
        }
    }

    components
}

/// Prune fat cores against per-day sub-instances built from their
/// components.
pub fn pruned_fat_cores(
    instances: &BTreeMap<DayName, FatSubproblemInstance>,
    mut cores: Vec<FatCore>,
    options: &PruneOptions,
) -> Vec<FatCore> {
    for core in &mut cores {
        if core.components.len() <= 1 || core.reason.is_empty() {
            continue;
        }
        let Some(instance) = instances.get(&core.days[0]) else {
            continue;
        };

        let metric = fat_components_metric(core);
        let mut sorted: Vec<FatRequest> = metric.keys().cloned().collect();
        sorted.sort_by_key(|request| (metric[request], request.clone()));

        let satisfiable = |components: &[FatRequest]| {
            let mut sub = FatSubproblemInstance {
                services: instance.services.clone(),
                day: instance.day.clone(),
                patients: BTreeMap::new(),
            };
            for request in components {
                let priority = instance.patients[&request.patient].priority;
                sub.patients
                    .entry(request.patient.clone())
                    .or_insert_with(|| FatSubproblemPatient { priority, requests: Vec::new() })
                    .requests
                    .push(ServiceOperator {
                        service: request.service.clone(),
                        operator: request.operator.clone(),
                    });
            }
            is_fully_satisfiable(
                &SubproblemInstance::Fat(sub),
                options.use_redundant_operator_cut,
                &options.limits,
            )
        };

        core.components = prune_components(&sorted, core.reason.len(), options, satisfiable);
    }
    cores
}

/// Prune slim cores; the heuristic ordering reads operators out of the
/// day's subproblem result.
pub fn pruned_slim_cores(
    instances: &BTreeMap<DayName, SlimSubproblemInstance>,
    results: &BTreeMap<DayName, SlimSubproblemResult>,
    mut cores: Vec<SlimCore>,
    options: &PruneOptions,
) -> Vec<SlimCore> {
    for core in &mut cores {
        if core.components.len() <= 1 || core.reason.is_empty() {
            continue;
        }
        let day = core.days[0];
        let (Some(instance), Some(result)) = (instances.get(&day), results.get(&day)) else {
            continue;
        };

        let metric = slim_components_metric(&instance.services, result, core);
        let mut sorted: Vec<SlimRequest> = metric.keys().cloned().collect();
        sorted.sort_by_key(|request| (metric[request], request.clone()));

        let satisfiable = |components: &[SlimRequest]| {
            let mut sub = SlimSubproblemInstance {
                services: instance.services.clone(),
                day: instance.day.clone(),
                patients: BTreeMap::new(),
            };
            for request in components {
                let priority = instance.patients[&request.patient].priority;
                sub.patients
                    .entry(request.patient.clone())
                    .or_insert_with(|| SlimSubproblemPatient { priority, requests: Vec::new() })
                    .requests
                    .push(request.service.clone());
            }
            is_fully_satisfiable(
                &SubproblemInstance::Slim(sub),
                options.use_redundant_operator_cut,
                &options.limits,
            )
        };

        core.components = prune_components(&sorted, core.reason.len(), options, satisfiable);
    }
    cores
}

// ============================================================================
// Preemptive cores and operator realignment (fat-fat)
// ============================================================================

/// Symmetry-breaking cores for days the forgetful subproblem satisfied in
/// full but with operator choices differing from the master's.
pub fn preemptive_cores(
    master: &FatMasterResult,
    results: &BTreeMap<DayName, SlimSubproblemResult>,
) -> Vec<FatCore> {
    let mut cores = Vec::new();
    for (day, result) in results {
        let Some(master_requests) = master.scheduled.get(day) else {
            continue;
        };
        if !result.rejected.is_empty() || result.scheduled.len() != master_requests.len() {
            continue;
        }
        let solutions_equal = master_requests.iter().all(|request| {
            result.scheduled.iter().any(|p| {
                p.patient == request.patient
                    && p.service == request.service
                    && p.operator == request.operator
            })
        });
        if !solutions_equal {
            cores.push(FatCore {
                days: vec![*day],
                reason: vec![master_requests[0].clone()],
                components: master_requests.clone(),
            });
        }
    }
    cores
}

/// Map a forgetful day result back onto the master's operator choices.
/// Used only for the in-memory copy that feeds core extraction; persisted
/// results keep the solver's operators.
pub fn realign_to_master(
    result: &SlimSubproblemResult,
    master_requests: &[FatRequest],
) -> FatSubproblemResult {
    let operator_of = |patient: &str, service: &str| -> Option<&FatRequest> {
        master_requests
            .iter()
            .find(|r| r.patient == patient && r.service == service)
    };

    let mut realigned = FatSubproblemResult::default();
    for placement in &result.scheduled {
        let operator = operator_of(&placement.patient, &placement.service)
            .map_or(placement.operator.as_str(), |r| r.operator.as_str());
        realigned.scheduled.push(Placement {
            patient: placement.patient.clone(),
            service: placement.service.clone(),
            operator: operator.to_string(),
            time: placement.time,
        });
    }
    for rejected in &result.rejected {
        match operator_of(&rejected.patient, &rejected.service) {
            Some(request) => realigned.rejected.push(request.clone()),
            None => warn!(
                patient = %rejected.patient,
                service = %rejected.service,
                "rejected request missing from master day assignment"
            ),
        }
    }
    realigned
}

// ============================================================================
// Dedup and aggregation
// ============================================================================

pub fn is_core_included<C: PartialEq>(core: &Core<C>, cores: &[Core<C>]) -> bool {
    cores.iter().any(|other| core.is_equivalent(other))
}

/// Set-union of two core lists, first list first; equivalent cores are
/// kept once.
pub fn aggregate_core_lists<C: Clone + PartialEq>(
    cores: &[Core<C>],
    other_cores: &[Core<C>],
) -> Vec<Core<C>> {
    let mut aggregate: Vec<Core<C>> = Vec::new();
    for core in cores.iter().chain(other_cores) {
        if !is_core_included(core, &aggregate) {
            aggregate.push(core.clone());
        }
    }
    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresched_core::Operator;
    use pretty_assertions::assert_eq;

    fn slim(patient: &str, service: &str) -> SlimRequest {
        SlimRequest { patient: patient.into(), service: service.into() }
    }

    fn fat(patient: &str, service: &str, operator: &str) -> FatRequest {
        FatRequest { patient: patient.into(), service: service.into(), operator: operator.into() }
    }

    #[test]
    fn basic_cores_carry_one_reason_each() {
        let days = vec![DayComponents {
            day: 1,
            rejected: vec![slim("pat00", "srv00"), slim("pat01", "srv00")],
            scheduled: vec![slim("pat02", "srv00")],
        }];
        let cores = basic_cores(&days);
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[0].reason.len(), 1);
        assert_eq!(cores[0].components.len(), 2);
        assert_eq!(cores[0].days, vec![1]);
    }

    #[test]
    fn generalist_core_covers_whole_day() {
        let days = vec![
            DayComponents {
                day: 1,
                rejected: vec![slim("pat00", "srv00")],
                scheduled: vec![slim("pat01", "srv00"), slim("pat02", "srv00")],
            },
            DayComponents { day: 2, rejected: vec![], scheduled: vec![slim("pat00", "srv00")] },
        ];
        let cores = generalist_cores(&days);
        assert_eq!(cores.len(), 1);
        assert_eq!(cores[0].reason.len(), 1);
        assert_eq!(cores[0].components.len(), 3);
    }

    #[test]
    fn reduction_drops_unlinked_components() {
        let core = FatCore {
            days: vec![1],
            reason: vec![fat("pat00", "srv00", "op00")],
            components: vec![
                fat("pat00", "srv00", "op00"),
                fat("pat01", "srv00", "op00"),  // linked through op00
                fat("pat01", "srv01", "op01"),  // linked through pat01
                fat("pat02", "srv00", "op02"),  // unrelated
            ],
        };
        let reduced = reduce_cores(vec![core], fat_link);
        assert_eq!(reduced[0].components.len(), 3);
        assert!(!reduced[0].components.contains(&fat("pat02", "srv00", "op02")));
    }

    #[test]
    fn slim_reduction_links_through_care_unit() {
        let mut services = BTreeMap::new();
        services.insert("srv00".to_string(), Service { care_unit: "cu00".into(), duration: 2 });
        services.insert("srv01".to_string(), Service { care_unit: "cu01".into(), duration: 2 });
        let core = SlimCore {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![
                slim("pat00", "srv00"),
                slim("pat01", "srv00"),  // same care unit
                slim("pat02", "srv01"),  // different care unit, different patient
            ],
        };
        let reduced = reduce_cores(vec![core], slim_link(&services));
        assert_eq!(reduced[0].components.len(), 2);
    }

    #[test]
    fn pruning_shrinks_to_an_infeasible_prefix() {
        // Day with one 6-slot operator: two duration-4 requests conflict,
        // and any conflicting prefix must keep at least two components.
        let mut instance = SlimSubproblemInstance::default();
        instance
            .services
            .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });
        instance.day.add_operator("cu00", "op00", Operator { start: 0, duration: 6 });
        instance.day.add_operator("cu00", "op01", Operator { start: 0, duration: 6 });
        for patient in ["pat00", "pat01", "pat02"] {
            instance.patients.insert(
                patient.into(),
                SlimSubproblemPatient { priority: 1, requests: vec!["srv00".into()] },
            );
        }
        let result = SlimSubproblemResult {
            scheduled: vec![
                Placement {
                    patient: "pat01".into(),
                    service: "srv00".into(),
                    operator: "op00".into(),
                    time: 0,
                },
                Placement {
                    patient: "pat02".into(),
                    service: "srv00".into(),
                    operator: "op01".into(),
                    time: 0,
                },
            ],
            rejected: vec![slim("pat00", "srv00")],
        };
        let core = SlimCore {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![
                slim("pat00", "srv00"),
                slim("pat01", "srv00"),
                slim("pat02", "srv00"),
            ],
        };

        let mut instances = BTreeMap::new();
        instances.insert(1, instance);
        let mut results = BTreeMap::new();
        results.insert(1, result);
        let options = PruneOptions {
            post_pruning_irreducibility: true,
            use_redundant_operator_cut: false,
            limits: SolveLimits::seconds(10.0),
        };
        let pruned = pruned_slim_cores(&instances, &results, vec![core], &options);
        // Three duration-4 requests cannot pack, two can: the minimal
        // infeasible subset keeps all three.
        assert_eq!(pruned[0].components.len(), 3);
    }

    #[test]
    fn preemptive_core_fires_on_operator_swap() {
        let mut master = FatMasterResult::default();
        master.scheduled.insert(
            1,
            vec![fat("pat00", "srv00", "op00"), fat("pat01", "srv00", "op01")],
        );
        let mut results = BTreeMap::new();
        results.insert(
            1,
            SlimSubproblemResult {
                scheduled: vec![
                    Placement {
                        patient: "pat00".into(),
                        service: "srv00".into(),
                        operator: "op01".into(),
                        time: 0,
                    },
                    Placement {
                        patient: "pat01".into(),
                        service: "srv00".into(),
                        operator: "op00".into(),
                        time: 0,
                    },
                ],
                rejected: vec![],
            },
        );
        let cores = preemptive_cores(&master, &results);
        assert_eq!(cores.len(), 1);
        assert_eq!(cores[0].components.len(), 2);

        // Identical operator choice produces no core.
        results.get_mut(&1).unwrap().scheduled.iter_mut().for_each(|p| {
            p.operator = if p.patient == "pat00" { "op00".into() } else { "op01".into() };
        });
        assert!(preemptive_cores(&master, &results).is_empty());
    }

    #[test]
    fn realignment_restores_master_operators() {
        let master = vec![fat("pat00", "srv00", "op00"), fat("pat01", "srv00", "op01")];
        let result = SlimSubproblemResult {
            scheduled: vec![Placement {
                patient: "pat00".into(),
                service: "srv00".into(),
                operator: "op01".into(),
                time: 2,
            }],
            rejected: vec![slim("pat01", "srv00")],
        };
        let realigned = realign_to_master(&result, &master);
        assert_eq!(realigned.scheduled[0].operator, "op00");
        assert_eq!(realigned.scheduled[0].time, 2);
        assert_eq!(realigned.rejected, vec![fat("pat01", "srv00", "op01")]);
    }

    #[test]
    fn aggregation_is_a_set_union() {
        let a = SlimCore {
            days: vec![1],
            reason: vec![slim("pat00", "srv00")],
            components: vec![slim("pat00", "srv00"), slim("pat01", "srv00")],
        };
        let mut permuted = a.clone();
        permuted.components.reverse();
        let b = SlimCore { days: vec![2], ..a.clone() };

        let aggregated = aggregate_core_lists(&[a.clone()], &[permuted, b]);
        assert_eq!(aggregated.len(), 2);
        assert!(is_core_included(&a, &aggregated));
    }
}
