//! Master relaxation models.
//!
//! The master selects which (patient, service, day[, operator]) assignments
//! to attempt, respecting capacity and daily-span aggregates but not start
//! times — its value is an upper bound on what any day packing can realise
//! for the same assignment set. Core cuts are appended between iterations
//! without rebuilding the model.

use crate::config::StructureType;
use crate::cores::Cores;
use crate::milp::{LinearExpr, Model, Relation, SolveLimits, SolveOutcome, VarId};
use caresched_core::{
    DayName, FatCore, FatMasterResult, FatRequest, MasterInstance, MasterResult, PatientName,
    ServiceName, SlimCore, SlimMasterResult, SlimRequest, TimeSlot, Window, WindowRequest,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Objective scale applied to the primary term when the hospital-access
/// penalty is active: `N·primary − Σ pat_uses_day` ranks solutions exactly
/// like `primary − (1/N)·Σ pat_uses_day` and stays integral.
fn scaled_weight(duration: TimeSlot, priority: i32, scale: i64) -> i64 {
    i64::from(duration) * i64::from(priority) * scale
}

// ============================================================================
// Slim master
// ============================================================================

/// Master over (patient, service, day) binaries with care-unit capacity.
pub struct SlimMasterModel {
    model: Model,
    window_vars: Vec<(WindowRequest, VarId)>,
    do_vars: Vec<(SlimRequest, DayName, VarId)>,
    do_lookup: HashMap<(PatientName, ServiceName, DayName), VarId>,
}

impl SlimMasterModel {
    pub fn build(instance: &MasterInstance, minimize_hospital_accesses: bool) -> Self {
        let mut window_index: BTreeSet<(PatientName, ServiceName, Window)> = BTreeSet::new();
        let mut do_index: BTreeSet<(PatientName, ServiceName, DayName)> = BTreeSet::new();
        let mut pat_days: BTreeSet<(PatientName, DayName)> = BTreeSet::new();

        for (patient_name, patient) in &instance.patients {
            for (service_name, windows) in &patient.requests {
                for window in windows {
                    window_index.insert((patient_name.clone(), service_name.clone(), *window));
                    for day in window.days() {
                        do_index.insert((patient_name.clone(), service_name.clone(), day));
                        pat_days.insert((patient_name.clone(), day));
                    }
                }
            }
        }

        let mut model = Model::new();

        let do_vars: Vec<(SlimRequest, DayName, VarId)> = do_index
            .iter()
            .map(|(patient, service, day)| {
                (
                    SlimRequest { patient: patient.clone(), service: service.clone() },
                    *day,
                    model.binary(),
                )
            })
            .collect();
        let do_lookup: HashMap<(PatientName, ServiceName, DayName), VarId> = do_vars
            .iter()
            .map(|(request, day, var)| {
                ((request.patient.clone(), request.service.clone(), *day), *var)
            })
            .collect();

        let window_vars: Vec<(WindowRequest, VarId)> = window_index
            .iter()
            .map(|(patient, service, window)| {
                (
                    WindowRequest {
                        patient: patient.clone(),
                        service: service.clone(),
                        window: *window,
                    },
                    model.binary(),
                )
            })
            .collect();

        // A satisfied window is satisfied on exactly one day inside it.
        for (request, window_var) in &window_vars {
            let mut link = LinearExpr::var(*window_var);
            for day in request.window.days() {
                if let Some(do_var) =
                    do_lookup.get(&(request.patient.clone(), request.service.clone(), day))
                {
                    link.add_term(*do_var, -1);
                }
            }
            model.constrain(link, Relation::Eq, 0);
        }

        // Care-unit capacity per day; elided when demand cannot exceed it.
        for (day_name, day) in &instance.days {
            for care_unit in day.care_units().keys() {
                let affected: Vec<&(SlimRequest, DayName, VarId)> = do_vars
                    .iter()
                    .filter(|(request, d, _)| {
                        d == day_name
                            && instance.care_unit_of(&request.service) == Some(care_unit.as_str())
                    })
                    .collect();
                if affected.is_empty() {
                    continue;
                }
                let capacity = day.care_unit_capacity(care_unit);
                let total: i64 = affected
                    .iter()
                    .filter_map(|(request, _, _)| instance.services.get(&request.service))
                    .map(|s| i64::from(s.duration))
                    .sum();
                if total <= i64::from(capacity) {
                    continue;
                }
                let mut expr = LinearExpr::new();
                for (request, _, var) in affected {
                    let duration = instance.services[&request.service].duration;
                    expr.add_term(*var, i64::from(duration));
                }
                model.constrain(expr, Relation::Le, i64::from(capacity));
            }
        }

        // Patient daily load bounded by the day's span.
        for (patient_name, day_name) in &pat_days {
            let affected: Vec<&(SlimRequest, DayName, VarId)> = do_vars
                .iter()
                .filter(|(request, d, _)| &request.patient == patient_name && d == day_name)
                .collect();
            let max_span = instance.days[day_name].max_span();
            let total: i64 = affected
                .iter()
                .filter_map(|(request, _, _)| instance.services.get(&request.service))
                .map(|s| i64::from(s.duration))
                .sum();
            if total <= i64::from(max_span) {
                continue;
            }
            let mut expr = LinearExpr::new();
            for (request, _, var) in affected {
                let duration = instance.services[&request.service].duration;
                expr.add_term(*var, i64::from(duration));
            }
            model.constrain(expr, Relation::Le, i64::from(max_span));
        }

        // Objective, with the optional integral hospital-access penalty.
        let scale = if minimize_hospital_accesses { pat_days.len().max(1) as i64 } else { 1 };
        let mut objective = LinearExpr::new();
        for (request, var) in &window_vars {
            let duration = instance.services[&request.service].duration;
            let priority = instance.patients[&request.patient].priority;
            objective.add_term(*var, scaled_weight(duration, priority, scale));
        }
        if minimize_hospital_accesses {
            for (patient_name, day_name) in &pat_days {
                let uses_day = model.binary();
                for (request, day, do_var) in &do_vars {
                    if &request.patient == patient_name && day == day_name {
                        model.constrain(
                            LinearExpr::new().term(*do_var, 1).term(uses_day, -1),
                            Relation::Le,
                            0,
                        );
                    }
                }
                objective.add_term(uses_day, -1);
            }
        }
        model.maximize(objective);

        Self { model, window_vars, do_vars, do_lookup }
    }

    pub fn add_core_cuts(&mut self, cores: &[SlimCore]) {
        for core in cores {
            for day in &core.days {
                let vars: Vec<VarId> = core
                    .components
                    .iter()
                    .filter_map(|component| {
                        self.do_lookup
                            .get(&(component.patient.clone(), component.service.clone(), *day))
                            .copied()
                    })
                    .collect();
                // A component without a variable cannot be assigned on this
                // day, making the cut vacuous.
                if vars.len() < core.components.len() {
                    continue;
                }
                let mut expr = LinearExpr::new();
                for var in vars {
                    expr.add_term(var, 1);
                }
                self.model.constrain(expr, Relation::Le, core.components.len() as i64 - 1);
            }
        }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> SlimMasterResult {
        let mut result = SlimMasterResult::default();
        for (request, day, var) in &self.do_vars {
            if outcome.is_set(*var) {
                result.scheduled.entry(*day).or_default().push(request.clone());
            }
        }
        for (request, var) in &self.window_vars {
            if !outcome.is_set(*var) {
                result.rejected.push(request.clone());
            }
        }
        result
    }

    pub fn size(&self) -> (usize, usize) {
        (self.model.var_count(), self.model.constraint_count())
    }
}

// ============================================================================
// Fat master
// ============================================================================

/// Master over (patient, service, day, operator) binaries with per-operator
/// capacity.
pub struct FatMasterModel {
    model: Model,
    window_vars: Vec<(WindowRequest, VarId)>,
    do_vars: Vec<(FatRequest, DayName, VarId)>,
    do_lookup: HashMap<(PatientName, ServiceName, DayName, String), VarId>,
}

impl FatMasterModel {
    pub fn build(instance: &MasterInstance, minimize_hospital_accesses: bool) -> Self {
        let mut window_index: BTreeSet<(PatientName, ServiceName, Window)> = BTreeSet::new();
        let mut do_index: BTreeSet<(PatientName, ServiceName, DayName, String)> = BTreeSet::new();
        let mut pat_days: BTreeSet<(PatientName, DayName)> = BTreeSet::new();

        for (patient_name, patient) in &instance.patients {
            for (service_name, windows) in &patient.requests {
                let Some(care_unit) = instance.care_unit_of(service_name) else {
                    continue;
                };
                for window in windows {
                    window_index.insert((patient_name.clone(), service_name.clone(), *window));
                    for day in window.days() {
                        let Some(operators) =
                            instance.days.get(&day).and_then(|d| d.care_unit(care_unit))
                        else {
                            continue;
                        };
                        for operator_name in operators.keys() {
                            do_index.insert((
                                patient_name.clone(),
                                service_name.clone(),
                                day,
                                operator_name.clone(),
                            ));
                            pat_days.insert((patient_name.clone(), day));
                        }
                    }
                }
            }
        }

        let mut model = Model::new();

        let do_vars: Vec<(FatRequest, DayName, VarId)> = do_index
            .iter()
            .map(|(patient, service, day, operator)| {
                (
                    FatRequest {
                        patient: patient.clone(),
                        service: service.clone(),
                        operator: operator.clone(),
                    },
                    *day,
                    model.binary(),
                )
            })
            .collect();
        let do_lookup: HashMap<(PatientName, ServiceName, DayName, String), VarId> = do_vars
            .iter()
            .map(|(request, day, var)| {
                (
                    (
                        request.patient.clone(),
                        request.service.clone(),
                        *day,
                        request.operator.clone(),
                    ),
                    *var,
                )
            })
            .collect();

        let window_vars: Vec<(WindowRequest, VarId)> = window_index
            .iter()
            .map(|(patient, service, window)| {
                (
                    WindowRequest {
                        patient: patient.clone(),
                        service: service.clone(),
                        window: *window,
                    },
                    model.binary(),
                )
            })
            .collect();

        // A satisfied window is satisfied by exactly one (day, operator).
        for (request, window_var) in &window_vars {
            let mut link = LinearExpr::var(*window_var);
            for (do_request, day, do_var) in &do_vars {
                if do_request.patient == request.patient
                    && do_request.service == request.service
                    && request.window.contains(*day)
                {
                    link.add_term(*do_var, -1);
                }
            }
            model.constrain(link, Relation::Eq, 0);
        }

        // Per-operator capacity; elided when demand cannot exceed it.
        for (day_name, day) in &instance.days {
            for (operator_name, _, operator) in day.operators() {
                let affected: Vec<&(FatRequest, DayName, VarId)> = do_vars
                    .iter()
                    .filter(|(request, d, _)| d == day_name && &request.operator == operator_name)
                    .collect();
                if affected.is_empty() {
                    continue;
                }
                let total: i64 = affected
                    .iter()
                    .filter_map(|(request, _, _)| instance.services.get(&request.service))
                    .map(|s| i64::from(s.duration))
                    .sum();
                if total <= i64::from(operator.duration) {
                    continue;
                }
                let mut expr = LinearExpr::new();
                for (request, _, var) in affected {
                    let duration = instance.services[&request.service].duration;
                    expr.add_term(*var, i64::from(duration));
                }
                model.constrain(expr, Relation::Le, i64::from(operator.duration));
            }
        }

        // Patient daily load bounded by the day's span.
        for (patient_name, day_name) in &pat_days {
            let affected: Vec<&(FatRequest, DayName, VarId)> = do_vars
                .iter()
                .filter(|(request, d, _)| &request.patient == patient_name && d == day_name)
                .collect();
            let max_span = instance.days[day_name].max_span();
            let total: i64 = affected
                .iter()
                .filter_map(|(request, _, _)| instance.services.get(&request.service))
                .map(|s| i64::from(s.duration))
                .sum();
            if total <= i64::from(max_span) {
                continue;
            }
            let mut expr = LinearExpr::new();
            for (request, _, var) in affected {
                let duration = instance.services[&request.service].duration;
                expr.add_term(*var, i64::from(duration));
            }
            model.constrain(expr, Relation::Le, i64::from(max_span));
        }

        // Objective, with the optional integral hospital-access penalty.
        let scale = if minimize_hospital_accesses { pat_days.len().max(1) as i64 } else { 1 };
        let mut objective = LinearExpr::new();
        for (request, var) in &window_vars {
            let duration = instance.services[&request.service].duration;
            let priority = instance.patients[&request.patient].priority;
            objective.add_term(*var, scaled_weight(duration, priority, scale));
        }
        if minimize_hospital_accesses {
            for (patient_name, day_name) in &pat_days {
                let uses_day = model.binary();
                // Group by (service, day): one link per (p, s, d) sum.
                let mut by_service: BTreeMap<&ServiceName, Vec<VarId>> = BTreeMap::new();
                for (request, day, do_var) in &do_vars {
                    if &request.patient == patient_name && day == day_name {
                        by_service.entry(&request.service).or_default().push(*do_var);
                    }
                }
                for vars in by_service.values() {
                    let mut link = LinearExpr::new().term(uses_day, -1);
                    for var in vars {
                        link.add_term(*var, 1);
                    }
                    model.constrain(link, Relation::Le, 0);
                }
                objective.add_term(uses_day, -1);
            }
        }
        model.maximize(objective);

        Self { model, window_vars, do_vars, do_lookup }
    }

    pub fn add_core_cuts(&mut self, cores: &[FatCore]) {
        for core in cores {
            for day in &core.days {
                let vars: Vec<VarId> = core
                    .components
                    .iter()
                    .filter_map(|component| {
                        self.do_lookup
                            .get(&(
                                component.patient.clone(),
                                component.service.clone(),
                                *day,
                                component.operator.clone(),
                            ))
                            .copied()
                    })
                    .collect();
                if vars.len() < core.components.len() {
                    continue;
                }
                let mut expr = LinearExpr::new();
                for var in vars {
                    expr.add_term(var, 1);
                }
                self.model.constrain(expr, Relation::Le, core.components.len() as i64 - 1);
            }
        }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> FatMasterResult {
        let mut result = FatMasterResult::default();
        for (request, day, var) in &self.do_vars {
            if outcome.is_set(*var) {
                result.scheduled.entry(*day).or_default().push(request.clone());
            }
        }
        for (request, var) in &self.window_vars {
            if !outcome.is_set(*var) {
                result.rejected.push(request.clone());
            }
        }
        result
    }

    pub fn size(&self) -> (usize, usize) {
        (self.model.var_count(), self.model.constraint_count())
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// The master model of a run, fat or slim per the structure type.
pub enum MasterModel {
    Fat(FatMasterModel),
    Slim(SlimMasterModel),
}

impl MasterModel {
    pub fn build(
        instance: &MasterInstance,
        structure: StructureType,
        minimize_hospital_accesses: bool,
    ) -> Self {
        if structure.master_is_fat() {
            MasterModel::Fat(FatMasterModel::build(instance, minimize_hospital_accesses))
        } else {
            MasterModel::Slim(SlimMasterModel::build(instance, minimize_hospital_accesses))
        }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        match self {
            MasterModel::Fat(model) => model.solve(limits),
            MasterModel::Slim(model) => model.solve(limits),
        }
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> MasterResult {
        match self {
            MasterModel::Fat(model) => MasterResult::Fat(model.extract(outcome)),
            MasterModel::Slim(model) => MasterResult::Slim(model.extract(outcome)),
        }
    }

    pub fn add_core_cuts(&mut self, cores: &Cores) {
        match (self, cores) {
            (MasterModel::Fat(model), Cores::Fat(cores)) => model.add_core_cuts(cores),
            (MasterModel::Slim(model), Cores::Slim(cores)) => model.add_core_cuts(cores),
            // Mismatched flavors cannot arise from the driver.
            _ => {}
        }
    }

    pub fn size(&self) -> (usize, usize) {
        match self {
            MasterModel::Fat(model) => model.size(),
            MasterModel::Slim(model) => model.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresched_core::{check, Day, MasterPatient, Operator, Service};
    use pretty_assertions::assert_eq;

    fn packed_instance(patients: usize) -> MasterInstance {
        let mut instance = MasterInstance::default();
        instance
            .services
            .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });
        let mut day = Day::default();
        day.add_operator("cu00", "op00", Operator { start: 0, duration: 6 });
        day.add_operator("cu00", "op01", Operator { start: 0, duration: 6 });
        instance.days.insert(1, day);
        for index in 0..patients {
            let mut patient = MasterPatient::new(1);
            patient.add_request("srv00", Window::new(1, 1));
            instance.patients.insert(format!("pat{index:02}"), patient);
        }
        instance
    }

    #[test]
    fn slim_master_accepts_all_when_capacity_allows() {
        let instance = packed_instance(3);
        let model = SlimMasterModel::build(&instance, false);
        let outcome = model.solve(&SolveLimits::seconds(10.0));
        assert_eq!(outcome.objective, Some(12));
        let result = model.extract(&outcome);
        assert_eq!(result.scheduled[&1].len(), 3);
        assert!(result.rejected.is_empty());
        assert_eq!(
            check::check_slim_master_result(&instance, &result),
            Vec::<String>::new()
        );
    }

    #[test]
    fn slim_master_capacity_drops_excess() {
        // Four duration-4 requests against 12 slots of care-unit capacity.
        let instance = packed_instance(4);
        let model = SlimMasterModel::build(&instance, false);
        let outcome = model.solve(&SolveLimits::seconds(10.0));
        assert_eq!(outcome.objective, Some(12));
        let result = model.extract(&outcome);
        assert_eq!(result.scheduled[&1].len(), 3);
        assert_eq!(result.rejected.len(), 1);
    }

    #[test]
    fn core_cut_forbids_component_combination() {
        let instance = packed_instance(3);
        let mut model = SlimMasterModel::build(&instance, false);
        let all: Vec<SlimRequest> = (0..3)
            .map(|index| SlimRequest {
                patient: format!("pat{index:02}"),
                service: "srv00".into(),
            })
            .collect();
        model.add_core_cuts(&[SlimCore {
            days: vec![1],
            reason: vec![all[0].clone()],
            components: all,
        }]);
        let outcome = model.solve(&SolveLimits::seconds(10.0));
        // One of the three must now stay unscheduled.
        assert_eq!(outcome.objective, Some(8));
        let result = model.extract(&outcome);
        assert_eq!(result.scheduled[&1].len(), 2);
        assert_eq!(result.rejected.len(), 1);
    }

    #[test]
    fn fat_master_respects_operator_capacity() {
        let instance = packed_instance(4);
        let model = FatMasterModel::build(&instance, false);
        let outcome = model.solve(&SolveLimits::seconds(10.0));
        let result = model.extract(&outcome);
        // Each operator holds one duration-4 request (6 slots each).
        assert_eq!(outcome.objective, Some(8));
        assert_eq!(result.scheduled[&1].len(), 2);
        assert_eq!(
            check::check_fat_master_result(&instance, &result),
            Vec::<String>::new()
        );
    }

    #[test]
    fn hospital_access_penalty_prefers_fewer_days() {
        // One patient, two services, two days: both fit on either day.
        let mut instance = MasterInstance::default();
        instance
            .services
            .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 2 });
        instance
            .services
            .insert("srv01".into(), Service { care_unit: "cu00".into(), duration: 2 });
        for day_name in 1..=2 {
            let mut day = Day::default();
            day.add_operator("cu00", "op00", Operator { start: 0, duration: 8 });
            instance.days.insert(day_name, day);
        }
        let mut patient = MasterPatient::new(1);
        patient.add_request("srv00", Window::new(1, 2));
        patient.add_request("srv01", Window::new(1, 2));
        instance.patients.insert("pat00".into(), patient);

        let model = SlimMasterModel::build(&instance, true);
        let outcome = model.solve(&SolveLimits::seconds(10.0));
        let result = model.extract(&outcome);
        let days_used: Vec<&DayName> =
            result.scheduled.iter().filter(|(_, r)| !r.is_empty()).map(|(d, _)| d).collect();
        assert_eq!(days_used.len(), 1, "both services should share one day");
        assert!(result.rejected.is_empty());
    }
}
