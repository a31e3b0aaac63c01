//! Per-day packing subproblems.
//!
//! Given the master's assignments for one day, place start times (and, for
//! the slim flavor, operators) so that no patient and no operator holds two
//! services at once. The big-M disjunctive linearisation, the auxiliary
//! overlap binaries and their truth tables follow the established
//! formulation; `time` is one-based inside the model (zero means
//! unscheduled) and shifted back on extraction.

use crate::milp::{LinearExpr, Model, Relation, SolveLimits, SolveOutcome, VarId};
use caresched_core::{
    FatRequest, FatSubproblemInstance, FatSubproblemResult, PatientName, Placement, ServiceName,
    SlimRequest, SlimSubproblemInstance, SlimSubproblemResult, SubproblemInstance,
    SubproblemResult, TimeSlot,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Objective bonus granted to the exact-match flag under preemptive
/// forbidding; dominates any packing objective of realistic size.
const EXACT_MATCH_BONUS: i64 = 1000;

// ============================================================================
// Slim subproblem (operator chosen by the model)
// ============================================================================

/// Packing model over free `(patient, service)` requests: binary
/// `satisfy`, integer start `time`, and one `do` binary per candidate
/// operator of the service's care unit.
pub struct SlimSubproblemModel {
    model: Model,
    satisfy_vars: Vec<(SlimRequest, VarId)>,
    time_lookup: HashMap<(PatientName, ServiceName), VarId>,
    do_vars: Vec<(FatRequest, VarId)>,
}

impl SlimSubproblemModel {
    /// Build the model. `exact_match` carries the master's fat assignment
    /// under preemptive forbidding: a binary `e` gains a large bonus when
    /// every master triple is honored.
    pub fn build(
        instance: &SlimSubproblemInstance,
        use_redundant_operator_cut: bool,
        exact_match: Option<&[FatRequest]>,
    ) -> Self {
        let mut satisfy_index: BTreeSet<(PatientName, ServiceName)> = BTreeSet::new();
        for (patient_name, patient) in &instance.patients {
            for service_name in &patient.requests {
                satisfy_index.insert((patient_name.clone(), service_name.clone()));
            }
        }

        let mut max_time: BTreeMap<&str, TimeSlot> = BTreeMap::new();
        for care_unit in instance.day.care_units().keys() {
            if let Some(end) = instance.day.max_end(care_unit) {
                max_time.insert(care_unit.as_str(), end + 1);
            }
        }

        let time_upper = |service_name: &str| -> TimeSlot {
            let service = &instance.services[service_name];
            let end = instance.day.max_end(&service.care_unit).unwrap_or(0);
            (end + 1 - service.duration).max(0)
        };

        let mut model = Model::new();

        let satisfy_vars: Vec<(SlimRequest, VarId)> = satisfy_index
            .iter()
            .map(|(patient, service)| {
                (
                    SlimRequest { patient: patient.clone(), service: service.clone() },
                    model.binary(),
                )
            })
            .collect();
        let satisfy_lookup: HashMap<(PatientName, ServiceName), VarId> = satisfy_vars
            .iter()
            .map(|(request, var)| ((request.patient.clone(), request.service.clone()), *var))
            .collect();

        let time_lookup: HashMap<(PatientName, ServiceName), VarId> = satisfy_index
            .iter()
            .map(|(patient, service)| {
                ((patient.clone(), service.clone()), model.integer(0, time_upper(service)))
            })
            .collect();

        let mut do_vars: Vec<(FatRequest, VarId)> = Vec::new();
        for (patient, service) in &satisfy_index {
            let care_unit = &instance.services[service].care_unit;
            if let Some(operators) = instance.day.care_unit(care_unit) {
                for operator in operators.keys() {
                    do_vars.push((
                        FatRequest {
                            patient: patient.clone(),
                            service: service.clone(),
                            operator: operator.clone(),
                        },
                        model.binary(),
                    ));
                }
            }
        }

        // time is positive exactly when the request is satisfied.
        for (request, satisfy) in &satisfy_vars {
            let time = time_lookup[&(request.patient.clone(), request.service.clone())];
            model.constrain(
                LinearExpr::new().term(*satisfy, 1).term(time, -1),
                Relation::Le,
                0,
            );
            model.constrain(
                LinearExpr::new()
                    .term(time, 1)
                    .term(*satisfy, -i64::from(time_upper(&request.service))),
                Relation::Le,
                0,
            );
        }

        // A satisfied request is assigned to exactly one operator.
        for (request, satisfy) in &satisfy_vars {
            let mut link = LinearExpr::new().term(*satisfy, -1);
            for (do_request, do_var) in &do_vars {
                if do_request.patient == request.patient && do_request.service == request.service
                {
                    link.add_term(*do_var, 1);
                }
            }
            model.constrain(link, Relation::Eq, 0);
        }

        // Assigned requests respect their operator's shift.
        for (do_request, do_var) in &do_vars {
            let service = &instance.services[&do_request.service];
            let (_, operator) = instance.day.operator(&do_request.operator).unwrap();
            let time = time_lookup[&(do_request.patient.clone(), do_request.service.clone())];
            let big_m = i64::from(max_time[service.care_unit.as_str()]);
            model.constrain(
                LinearExpr::new()
                    .term(time, 1)
                    .term(*do_var, -i64::from(operator.start + 1)),
                Relation::Ge,
                0,
            );
            // time + dur ≤ op.end + 1 + (1 − do)·M
            model.constrain(
                LinearExpr::new().term(time, 1).term(*do_var, big_m),
                Relation::Le,
                i64::from(operator.end()) + 1 - i64::from(service.duration) + big_m,
            );
        }

        // Disjunction of two services of the same patient.
        for (patient_name, patient) in &instance.patients {
            let services: Vec<&ServiceName> = {
                let unique: BTreeSet<&ServiceName> = patient.requests.iter().collect();
                unique.into_iter().collect()
            };
            for i in 0..services.len() {
                for j in (i + 1)..services.len() {
                    let (first, second) = (services[i], services[j]);
                    let time_first = time_lookup[&(patient_name.clone(), first.clone())];
                    let time_second = time_lookup[&(patient_name.clone(), second.clone())];
                    let satisfy_first = satisfy_lookup[&(patient_name.clone(), first.clone())];
                    let satisfy_second = satisfy_lookup[&(patient_name.clone(), second.clone())];
                    let duration_first = i64::from(instance.services[first].duration);
                    let duration_second = i64::from(instance.services[second].duration);
                    let m_first =
                        i64::from(max_time[instance.services[first].care_unit.as_str()]);
                    let m_second =
                        i64::from(max_time[instance.services[second].care_unit.as_str()]);

                    let overlap = model.binary();
                    model.constrain(
                        LinearExpr::new()
                            .term(time_first, 1)
                            .term(satisfy_first, duration_first)
                            .term(time_second, -1)
                            .term(overlap, m_first),
                        Relation::Le,
                        m_first,
                    );
                    model.constrain(
                        LinearExpr::new()
                            .term(time_second, 1)
                            .term(satisfy_second, duration_second)
                            .term(time_first, -1)
                            .term(overlap, -m_second),
                        Relation::Le,
                        0,
                    );
                    model.constrain(
                        LinearExpr::new().term(overlap, 1).term(satisfy_second, -1),
                        Relation::Le,
                        0,
                    );
                    model.constrain(
                        LinearExpr::new()
                            .term(satisfy_second, 1)
                            .term(satisfy_first, -1)
                            .term(overlap, -1),
                        Relation::Le,
                        0,
                    );
                }
            }
        }

        // Disjunction of two requests assigned to the same operator.
        for i in 0..do_vars.len() {
            for j in (i + 1)..do_vars.len() {
                let (first_request, first_do) = &do_vars[i];
                let (second_request, second_do) = &do_vars[j];
                if first_request.operator != second_request.operator {
                    continue;
                }
                // Same-patient pairs are already separated by the patient
                // disjunction above.
                if first_request.patient == second_request.patient {
                    continue;
                }
                let time_first = time_lookup
                    [&(first_request.patient.clone(), first_request.service.clone())];
                let time_second = time_lookup
                    [&(second_request.patient.clone(), second_request.service.clone())];
                let duration_first = i64::from(instance.services[&first_request.service].duration);
                let duration_second =
                    i64::from(instance.services[&second_request.service].duration);
                let care_unit = instance.day.operator(&first_request.operator).unwrap().0;
                let big_m = i64::from(max_time[care_unit.as_str()]);

                let overlap_first = model.binary();
                let overlap_second = model.binary();
                model.constrain(
                    LinearExpr::new()
                        .term(time_first, 1)
                        .term(*first_do, duration_first)
                        .term(time_second, -1)
                        .term(overlap_first, big_m),
                    Relation::Le,
                    big_m,
                );
                model.constrain(
                    LinearExpr::new()
                        .term(time_second, 1)
                        .term(*second_do, duration_second)
                        .term(time_first, -1)
                        .term(overlap_second, big_m),
                    Relation::Le,
                    big_m,
                );
                model.constrain(
                    LinearExpr::new()
                        .term(*first_do, 1)
                        .term(*second_do, 1)
                        .term(overlap_first, -1)
                        .term(overlap_second, -1),
                    Relation::Le,
                    1,
                );
                model.constrain(
                    LinearExpr::new()
                        .term(overlap_first, 1)
                        .term(overlap_second, 1)
                        .term(*first_do, -1),
                    Relation::Le,
                    0,
                );
                model.constrain(
                    LinearExpr::new()
                        .term(overlap_first, 1)
                        .term(overlap_second, 1)
                        .term(*second_do, -1),
                    Relation::Le,
                    0,
                );
            }
        }

        // Aggregate operator-duration cut, redundant but sometimes useful.
        if use_redundant_operator_cut {
            for (operator_name, _, operator) in instance.day.operators() {
                let affected: Vec<&(FatRequest, VarId)> = do_vars
                    .iter()
                    .filter(|(request, _)| &request.operator == operator_name)
                    .collect();
                let total: i64 = affected
                    .iter()
                    .map(|(request, _)| i64::from(instance.services[&request.service].duration))
                    .sum();
                if affected.is_empty() || total <= i64::from(operator.duration) {
                    continue;
                }
                let mut expr = LinearExpr::new();
                for (request, var) in affected {
                    expr.add_term(*var, i64::from(instance.services[&request.service].duration));
                }
                model.constrain(expr, Relation::Le, i64::from(operator.duration));
            }
        }

        // Objective: weighted satisfied duration, or the exact-match form.
        match exact_match {
            None => {
                let mut objective = LinearExpr::new();
                for (request, satisfy) in &satisfy_vars {
                    let duration = i64::from(instance.services[&request.service].duration);
                    let priority = i64::from(instance.patients[&request.patient].priority);
                    objective.add_term(*satisfy, duration * priority);
                }
                model.maximize(objective);
            }
            Some(master_requests) => {
                let exact = model.binary();
                for (do_request, do_var) in &do_vars {
                    if master_requests.contains(do_request) {
                        model.constrain(
                            LinearExpr::new().term(*do_var, 1).term(exact, -1),
                            Relation::Ge,
                            0,
                        );
                    }
                }
                let mut objective = LinearExpr::new().term(exact, EXACT_MATCH_BONUS);
                for (do_request, do_var) in &do_vars {
                    let duration = i64::from(instance.services[&do_request.service].duration);
                    let priority = i64::from(instance.patients[&do_request.patient].priority);
                    objective.add_term(*do_var, duration * priority);
                }
                model.maximize(objective);
            }
        }

        Self { model, satisfy_vars, time_lookup, do_vars }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> SlimSubproblemResult {
        let mut result = SlimSubproblemResult::default();
        for (request, do_var) in &self.do_vars {
            if outcome.is_set(*do_var) {
                let time =
                    self.time_lookup[&(request.patient.clone(), request.service.clone())];
                result.scheduled.push(Placement {
                    patient: request.patient.clone(),
                    service: request.service.clone(),
                    operator: request.operator.clone(),
                    time: outcome.value(time) - 1,
                });
            }
        }
        for (request, satisfy) in &self.satisfy_vars {
            if !outcome.is_set(*satisfy) {
                result.rejected.push(request.clone());
            }
        }
        result.scheduled.sort();
        result.rejected.sort();
        result
    }

    pub fn size(&self) -> (usize, usize) {
        (self.model.var_count(), self.model.constraint_count())
    }
}

// ============================================================================
// Fat subproblem (operator pinned by the master)
// ============================================================================

/// Packing model over `(patient, service, operator)` triples fixed by the
/// master; only start times are free.
pub struct FatSubproblemModel {
    model: Model,
    entries: Vec<(FatRequest, VarId, VarId)>,
}

impl FatSubproblemModel {
    pub fn build(instance: &FatSubproblemInstance) -> Self {
        let mut do_index: BTreeSet<FatRequest> = BTreeSet::new();
        for (patient_name, patient) in &instance.patients {
            for request in &patient.requests {
                do_index.insert(FatRequest {
                    patient: patient_name.clone(),
                    service: request.service.clone(),
                    operator: request.operator.clone(),
                });
            }
        }

        let mut max_time: BTreeMap<&str, TimeSlot> = BTreeMap::new();
        for care_unit in instance.day.care_units().keys() {
            if let Some(end) = instance.day.max_end(care_unit) {
                max_time.insert(care_unit.as_str(), end + 1);
            }
        }

        let mut model = Model::new();
        let entries: Vec<(FatRequest, VarId, VarId)> = do_index
            .into_iter()
            .map(|request| {
                let service = &instance.services[&request.service];
                let upper = instance
                    .day
                    .operator(&request.operator)
                    .map(|(_, op)| (op.end() + 1 - service.duration).max(0))
                    .unwrap_or(0);
                let do_var = model.binary();
                let time_var = model.integer(0, upper);
                (request, do_var, time_var)
            })
            .collect();

        for (request, do_var, time_var) in &entries {
            let service = &instance.services[&request.service];
            let Some((_, operator)) = instance.day.operator(&request.operator) else {
                continue;
            };
            // (start + 1)·do ≤ time ≤ (end − dur + 1)·do
            model.constrain(
                LinearExpr::new()
                    .term(*time_var, 1)
                    .term(*do_var, -i64::from(operator.start + 1)),
                Relation::Ge,
                0,
            );
            model.constrain(
                LinearExpr::new().term(*time_var, 1).term(
                    *do_var,
                    -i64::from(operator.end() - service.duration + 1),
                ),
                Relation::Le,
                0,
            );
        }

        // Disjunction of requests sharing a patient or an operator.
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (first, first_do, first_time) = &entries[i];
                let (second, second_do, second_time) = &entries[j];
                if first.patient != second.patient && first.operator != second.operator {
                    continue;
                }
                let duration_first = i64::from(instance.services[&first.service].duration);
                let duration_second = i64::from(instance.services[&second.service].duration);
                let m_first =
                    i64::from(max_time[instance.services[&first.service].care_unit.as_str()]);
                let m_second =
                    i64::from(max_time[instance.services[&second.service].care_unit.as_str()]);

                let overlap = model.binary();
                model.constrain(
                    LinearExpr::new()
                        .term(*first_time, 1)
                        .term(*first_do, duration_first)
                        .term(*second_time, -1)
                        .term(overlap, m_first),
                    Relation::Le,
                    m_first,
                );
                model.constrain(
                    LinearExpr::new()
                        .term(*second_time, 1)
                        .term(*second_do, duration_second)
                        .term(*first_time, -1)
                        .term(overlap, -m_second),
                    Relation::Le,
                    0,
                );
                model.constrain(
                    LinearExpr::new().term(overlap, 1).term(*second_do, -1),
                    Relation::Le,
                    0,
                );
                model.constrain(
                    LinearExpr::new()
                        .term(*second_do, 1)
                        .term(*first_do, -1)
                        .term(overlap, -1),
                    Relation::Le,
                    0,
                );
            }
        }

        let mut objective = LinearExpr::new();
        for (request, do_var, _) in &entries {
            let duration = i64::from(instance.services[&request.service].duration);
            let priority = i64::from(instance.patients[&request.patient].priority);
            objective.add_term(*do_var, duration * priority);
        }
        model.maximize(objective);

        Self { model, entries }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> FatSubproblemResult {
        let mut result = FatSubproblemResult::default();
        for (request, do_var, time_var) in &self.entries {
            if outcome.is_set(*do_var) {
                result.scheduled.push(Placement {
                    patient: request.patient.clone(),
                    service: request.service.clone(),
                    operator: request.operator.clone(),
                    time: outcome.value(*time_var) - 1,
                });
            } else {
                result.rejected.push(request.clone());
            }
        }
        result.scheduled.sort();
        result.rejected.sort();
        result
    }

    pub fn size(&self) -> (usize, usize) {
        (self.model.var_count(), self.model.constraint_count())
    }
}

// ============================================================================
// Pruning oracle
// ============================================================================

/// Solve a day instance and report whether every request was placed.
///
/// An oracle that runs out of budget without an incumbent counts as
/// satisfiable, so core pruning stops shrinking instead of over-cutting.
pub fn is_fully_satisfiable(
    instance: &SubproblemInstance,
    use_redundant_operator_cut: bool,
    limits: &SolveLimits,
) -> bool {
    match instance {
        SubproblemInstance::Fat(instance) => {
            let model = FatSubproblemModel::build(instance);
            let outcome = model.solve(limits);
            if !outcome.has_solution() {
                return true;
            }
            model.extract(&outcome).rejected.is_empty()
        }
        SubproblemInstance::Slim(instance) => {
            let model = SlimSubproblemModel::build(instance, use_redundant_operator_cut, None);
            let outcome = model.solve(limits);
            if !outcome.has_solution() {
                return true;
            }
            model.extract(&outcome).rejected.is_empty()
        }
    }
}
