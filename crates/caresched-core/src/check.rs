//! Structural checkers for every artifact the engine produces or consumes.
//!
//! Each checker returns a list of human-readable errors; an empty list means
//! the artifact is structurally sound. Checkers never panic on malformed
//! input — a dangling reference becomes an error line, not a crash — because
//! they run on solver output and on files read back from disk.

use crate::{
    Core, DayName, FatMasterResult, FatSubproblemInstance, FinalResult, MasterInstance,
    MasterResult, OperatorName, PatientName, Placement, RequestRef, Service, ServiceName,
    SlimMasterResult, SlimSubproblemInstance, SubproblemInstance, SubproblemResult, TimeSlot,
    WindowRequest,
};
use std::collections::BTreeMap;

// ============================================================================
// Master instance
// ============================================================================

pub fn check_master_instance(instance: &MasterInstance) -> Vec<String> {
    let mut errors = Vec::new();

    if instance.days.is_empty() {
        errors.push("instance has no days".to_string());
    }
    if instance.services.is_empty() {
        errors.push("instance has no services".to_string());
    }
    if instance.patients.is_empty() {
        errors.push("instance has no patients".to_string());
    }

    let min_day = instance.days.keys().min().copied().unwrap_or(0);
    let max_day = instance.days.keys().max().copied().unwrap_or(0);
    if !instance.days.is_empty()
        && instance.days.len() as i64 != i64::from(max_day) - i64::from(min_day) + 1
    {
        errors.push("instance days have gaps".to_string());
    }

    let mut care_unit_names = std::collections::BTreeSet::new();
    for day in instance.days.values() {
        care_unit_names.extend(day.care_units().keys().cloned());
    }

    for (day_name, day) in &instance.days {
        if day.care_units().is_empty() {
            errors.push(format!("day {day_name} has no care units"));
        }
        for (care_unit_name, operators) in day.care_units() {
            if operators.is_empty() {
                errors.push(format!(
                    "care unit {care_unit_name} of day {day_name} has no operators"
                ));
            }
            for (operator_name, operator) in operators {
                if operator.start < 0 || operator.duration <= 0 {
                    errors.push(format!(
                        "operator {operator_name} of care unit {care_unit_name} of day {day_name} has wrong parameters"
                    ));
                }
            }
        }
    }

    for (service_name, service) in &instance.services {
        if !care_unit_names.contains(&service.care_unit) {
            errors.push(format!(
                "service {service_name} has a non existent care unit ({})",
                service.care_unit
            ));
        }
        if service.duration <= 0 {
            errors.push(format!(
                "service {service_name} has an invalid duration ({})",
                service.duration
            ));
        }
    }

    for (patient_name, patient) in &instance.patients {
        if patient.priority <= 0 {
            errors.push(format!("priority of patient {patient_name} is invalid"));
        }
        if patient.requests.is_empty() {
            errors.push(format!("patient {patient_name} has no requests"));
        }
        for (service_name, windows) in &patient.requests {
            if !instance.services.contains_key(service_name) {
                errors.push(format!(
                    "patient {patient_name} requests a non existent service ({service_name})"
                ));
            }
            if windows.is_empty() {
                errors.push(format!(
                    "patient {patient_name} requests service {service_name} with no windows"
                ));
            }
            for window in windows {
                if window.start < min_day || window.end > max_day || window.start > window.end {
                    errors.push(format!(
                        "patient {patient_name} requests service {service_name} with invalid window [{}, {}]",
                        window.start, window.end
                    ));
                }
            }
        }
    }

    errors
}

// ============================================================================
// Master results
// ============================================================================

fn check_rejected_requests(instance: &MasterInstance, rejected: &[WindowRequest]) -> Vec<String> {
    let mut errors = Vec::new();
    for request in rejected {
        if !instance.patients.contains_key(&request.patient) {
            errors.push(format!("rejected patient {} does not exist", request.patient));
        }
        if !instance.services.contains_key(&request.service) {
            errors.push(format!("rejected service {} does not exist", request.service));
        }
    }
    errors
}

/// Every instance window must be satisfied exactly once in `scheduled` or
/// appear in `rejected`, never both and never twice.
fn check_windows_respect<R: RequestRef>(
    instance: &MasterInstance,
    scheduled: &BTreeMap<DayName, Vec<R>>,
    rejected: &[WindowRequest],
) -> Vec<String> {
    let mut errors = Vec::new();

    let mut open_requests: Vec<WindowRequest> = instance.window_requests().collect();

    for request in rejected {
        if !open_requests.contains(request) {
            errors.push(format!(
                "rejected request ({}, {}, [{}, {}]) is not present in the instance (or duplicated)",
                request.patient, request.service, request.window.start, request.window.end
            ));
        } else {
            open_requests.retain(|r| r != request);
        }
    }

    for (day_name, requests) in scheduled {
        for request in requests {
            let matching: Vec<WindowRequest> = open_requests
                .iter()
                .filter(|open| {
                    open.patient == request.patient()
                        && open.service == request.service()
                        && open.window.contains(*day_name)
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                errors.push(format!(
                    "request ({}, {}) on day {day_name} is not requested by anyone in the instance (or already satisfied in the same window)",
                    request.patient(),
                    request.service()
                ));
            }
            open_requests.retain(|open| !matching.contains(open));
        }
    }

    if let Some(first) = open_requests.first() {
        errors.push(format!(
            "{} requests are neither scheduled nor rejected (first is ({}, {}, [{}, {}]))",
            open_requests.len(),
            first.patient,
            first.service,
            first.window.start,
            first.window.end
        ));
    }

    errors
}

/// Capacity bookkeeping shared by the fat master and final result checks:
/// per-operator budgets plus the per-patient daily span budget.
fn check_fat_daily_loads<R: RequestRef>(
    instance: &MasterInstance,
    scheduled: &BTreeMap<DayName, Vec<R>>,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (day_name, requests) in scheduled {
        let Some(day) = instance.days.get(day_name) else {
            errors.push(format!("day {day_name} does not exist"));
            continue;
        };

        let max_span = day.max_span();
        let mut patient_remaining: BTreeMap<&str, TimeSlot> = BTreeMap::new();
        let mut operator_remaining: BTreeMap<OperatorName, TimeSlot> = day
            .operators()
            .map(|(name, _, op)| (name.clone(), op.duration))
            .collect();

        for request in requests {
            let Some(service) = instance.services.get(request.service()) else {
                continue;
            };
            let patient_budget =
                patient_remaining.entry(request.patient()).or_insert(max_span);
            *patient_budget -= service.duration;
            if *patient_budget < 0 {
                errors.push(format!(
                    "patient {} is overloaded in day {day_name}",
                    request.patient()
                ));
            }
            if let Some(operator_name) = request.operator() {
                if let Some(budget) = operator_remaining.get_mut(operator_name) {
                    *budget -= service.duration;
                    if *budget < 0 {
                        errors.push(format!(
                            "operator {operator_name} is overloaded in day {day_name}"
                        ));
                    }
                }
            }
        }
    }

    errors
}

pub fn check_fat_master_result(instance: &MasterInstance, result: &FatMasterResult) -> Vec<String> {
    let mut errors = check_fat_scheduled_references(instance, &result.scheduled);
    errors.extend(check_rejected_requests(instance, &result.rejected));
    errors.extend(check_fat_daily_loads(instance, &result.scheduled));
    errors.extend(check_windows_respect(instance, &result.scheduled, &result.rejected));
    errors
}

fn check_fat_scheduled_references<R: RequestRef>(
    instance: &MasterInstance,
    scheduled: &BTreeMap<DayName, Vec<R>>,
) -> Vec<String> {
    let mut errors = Vec::new();
    for (day_name, requests) in scheduled {
        for request in requests {
            if !instance.patients.contains_key(request.patient()) {
                errors.push(format!(
                    "patient {} in day {day_name} does not exist",
                    request.patient()
                ));
            }
            let Some(service) = instance.services.get(request.service()) else {
                errors.push(format!(
                    "service {} in day {day_name} does not exist",
                    request.service()
                ));
                continue;
            };
            let Some(day) = instance.days.get(day_name) else {
                continue;
            };
            match day.care_unit(&service.care_unit) {
                None => errors.push(format!(
                    "care unit {} in day {day_name} does not exist",
                    service.care_unit
                )),
                Some(operators) => {
                    if let Some(operator_name) = request.operator() {
                        if !operators.contains_key(operator_name) {
                            errors.push(format!(
                                "operator {operator_name} in day {day_name} does not exist"
                            ));
                        }
                    }
                }
            }
        }
    }
    errors
}

pub fn check_slim_master_result(
    instance: &MasterInstance,
    result: &SlimMasterResult,
) -> Vec<String> {
    let mut errors = Vec::new();

    for (day_name, requests) in &result.scheduled {
        if requests.is_empty() {
            errors.push(format!("day {day_name} has no requests"));
        }
    }
    errors.extend(check_fat_scheduled_references(instance, &result.scheduled));
    errors.extend(check_rejected_requests(instance, &result.rejected));

    // Per-care-unit capacity instead of per-operator.
    for (day_name, requests) in &result.scheduled {
        let Some(day) = instance.days.get(day_name) else {
            continue;
        };
        let max_span = day.max_span();
        let mut patient_remaining: BTreeMap<&str, TimeSlot> = BTreeMap::new();
        let mut care_unit_remaining: BTreeMap<&str, TimeSlot> = day
            .care_units()
            .keys()
            .map(|cu| (cu.as_str(), day.care_unit_capacity(cu)))
            .collect();

        for request in requests {
            let Some(service) = instance.services.get(&request.service) else {
                continue;
            };
            let patient_budget =
                patient_remaining.entry(request.patient.as_str()).or_insert(max_span);
            *patient_budget -= service.duration;
            if *patient_budget < 0 {
                errors.push(format!(
                    "patient {} is overloaded in day {day_name}",
                    request.patient
                ));
            }
            if let Some(budget) = care_unit_remaining.get_mut(service.care_unit.as_str()) {
                *budget -= service.duration;
                if *budget < 0 {
                    errors.push(format!(
                        "care unit {} is overloaded in day {day_name}",
                        service.care_unit
                    ));
                }
            }
        }
    }

    errors.extend(check_windows_respect(instance, &result.scheduled, &result.rejected));
    errors
}

pub fn check_master_result(instance: &MasterInstance, result: &MasterResult) -> Vec<String> {
    match result {
        MasterResult::Fat(result) => check_fat_master_result(instance, result),
        MasterResult::Slim(result) => check_slim_master_result(instance, result),
    }
}

// ============================================================================
// Subproblem instances
// ============================================================================

fn check_subproblem_common(
    services: &BTreeMap<ServiceName, Service>,
    day: &crate::Day,
    patient_count: usize,
) -> Vec<String> {
    let mut errors = Vec::new();

    if day.care_units().is_empty() {
        errors.push("instance has no care unit".to_string());
    }
    if services.is_empty() {
        errors.push("instance has no services".to_string());
    }
    if patient_count == 0 {
        errors.push("instance has no patients".to_string());
    }

    for (care_unit_name, operators) in day.care_units() {
        if operators.is_empty() {
            errors.push(format!("care unit {care_unit_name} has no operators"));
        }
        for (operator_name, operator) in operators {
            if operator.start < 0 || operator.duration <= 0 {
                errors.push(format!(
                    "operator {operator_name} of care unit {care_unit_name} has wrong parameters"
                ));
            }
        }
    }

    for (service_name, service) in services {
        if day.care_unit(&service.care_unit).is_none() {
            errors.push(format!(
                "service {service_name} has a non existent care unit ({})",
                service.care_unit
            ));
        }
        if service.duration <= 0 {
            errors.push(format!(
                "service {service_name} has an invalid duration ({})",
                service.duration
            ));
        }
    }

    errors
}

pub fn check_fat_subproblem_instance(instance: &FatSubproblemInstance) -> Vec<String> {
    let mut errors =
        check_subproblem_common(&instance.services, &instance.day, instance.patients.len());

    for (patient_name, patient) in &instance.patients {
        if patient.priority <= 0 {
            errors.push(format!("priority of patient {patient_name} is invalid"));
        }
        if patient.requests.is_empty() {
            errors.push(format!("patient {patient_name} has no requests"));
        }
        for request in &patient.requests {
            let Some(service) = instance.services.get(&request.service) else {
                errors.push(format!(
                    "patient {patient_name} requests a non existent service ({})",
                    request.service
                ));
                continue;
            };
            match instance.day.care_unit(&service.care_unit) {
                None => errors.push(format!(
                    "patient {patient_name} requests a non existent care unit ({})",
                    service.care_unit
                )),
                Some(operators) => {
                    if !operators.contains_key(&request.operator) {
                        errors.push(format!(
                            "patient {patient_name} requests a non existent operator ({})",
                            request.operator
                        ));
                    }
                }
            }
        }
    }

    let max_span = instance.day.max_span();
    let mut operator_remaining: BTreeMap<OperatorName, TimeSlot> = instance
        .day
        .operators()
        .map(|(name, _, op)| (name.clone(), op.duration))
        .collect();
    let mut patient_remaining: BTreeMap<&PatientName, TimeSlot> =
        instance.patients.keys().map(|name| (name, max_span)).collect();

    for (patient_name, patient) in &instance.patients {
        let unique: std::collections::BTreeSet<&crate::ServiceOperator> =
            patient.requests.iter().collect();
        if unique.len() != patient.requests.len() {
            errors.push(format!("patient {patient_name} has some duplicate requests"));
        }
        for request in &patient.requests {
            let Some(service) = instance.services.get(&request.service) else {
                continue;
            };
            if let Some(budget) = patient_remaining.get_mut(patient_name) {
                *budget -= service.duration;
                if *budget < 0 {
                    errors.push(format!("patient {patient_name} is overloaded"));
                }
            }
            if let Some(budget) = operator_remaining.get_mut(&request.operator) {
                *budget -= service.duration;
                if *budget < 0 {
                    errors.push(format!("operator {} is overloaded", request.operator));
                }
            }
        }
    }

    errors
}

pub fn check_slim_subproblem_instance(instance: &SlimSubproblemInstance) -> Vec<String> {
    let mut errors =
        check_subproblem_common(&instance.services, &instance.day, instance.patients.len());

    for (patient_name, patient) in &instance.patients {
        if patient.priority <= 0 {
            errors.push(format!("priority of patient {patient_name} is invalid"));
        }
        if patient.requests.is_empty() {
            errors.push(format!("patient {patient_name} has no requests"));
        }
        for service_name in &patient.requests {
            let Some(service) = instance.services.get(service_name) else {
                errors.push(format!(
                    "patient {patient_name} requests a non existent service ({service_name})"
                ));
                continue;
            };
            if instance.day.care_unit(&service.care_unit).is_none() {
                errors.push(format!(
                    "patient {patient_name} requests a non existent care unit ({})",
                    service.care_unit
                ));
            }
        }
    }

    let max_span = instance.day.max_span();
    let mut care_unit_remaining: BTreeMap<&str, TimeSlot> = instance
        .day
        .care_units()
        .keys()
        .map(|cu| (cu.as_str(), instance.day.care_unit_capacity(cu)))
        .collect();
    let mut patient_remaining: BTreeMap<&PatientName, TimeSlot> =
        instance.patients.keys().map(|name| (name, max_span)).collect();

    for (patient_name, patient) in &instance.patients {
        let unique: std::collections::BTreeSet<&ServiceName> = patient.requests.iter().collect();
        if unique.len() != patient.requests.len() {
            errors.push(format!("patient {patient_name} has some duplicate requests"));
        }
        for service_name in &patient.requests {
            let Some(service) = instance.services.get(service_name) else {
                continue;
            };
            if let Some(budget) = patient_remaining.get_mut(patient_name) {
                *budget -= service.duration;
                if *budget < 0 {
                    errors.push(format!("patient {patient_name} is overloaded"));
                }
            }
            if let Some(budget) = care_unit_remaining.get_mut(service.care_unit.as_str()) {
                *budget -= service.duration;
                if *budget < 0 {
                    errors.push(format!("care unit {} is overloaded", service.care_unit));
                }
            }
        }
    }

    errors
}

pub fn check_subproblem_instance(instance: &SubproblemInstance) -> Vec<String> {
    match instance {
        SubproblemInstance::Fat(instance) => check_fat_subproblem_instance(instance),
        SubproblemInstance::Slim(instance) => check_slim_subproblem_instance(instance),
    }
}

// ============================================================================
// Subproblem results
// ============================================================================

/// Pairwise disjointness of placements: two placements sharing a patient or
/// an operator must not overlap in time, and no (patient, service) pair may
/// be placed twice.
pub fn check_overlaps(
    services: &BTreeMap<ServiceName, Service>,
    placements: &[Placement],
) -> Vec<String> {
    let mut errors = Vec::new();

    for (i, placement) in placements.iter().enumerate() {
        let Some(duration) = services.get(&placement.service).map(|s| s.duration) else {
            continue;
        };
        for other in &placements[i + 1..] {
            let Some(other_duration) = services.get(&other.service).map(|s| s.duration) else {
                continue;
            };
            let same_patient = placement.patient == other.patient;
            if same_patient && placement.service == other.service {
                errors.push(format!(
                    "patient {} requests service {} multiple times",
                    placement.patient, placement.service
                ));
            }
            let same_operator = placement.operator == other.operator;
            if same_patient || same_operator {
                let overlap = (placement.time <= other.time
                    && placement.time + duration > other.time)
                    || (other.time <= placement.time
                        && other.time + other_duration > placement.time);
                if overlap {
                    errors.push(format!(
                        "placements ({}, {}, {}, t={}) and ({}, {}, {}, t={}) overlap in time",
                        placement.patient,
                        placement.service,
                        placement.operator,
                        placement.time,
                        other.patient,
                        other.service,
                        other.operator,
                        other.time
                    ));
                }
            }
        }
    }

    errors
}

pub fn check_subproblem_result(
    instance: &SubproblemInstance,
    result: &SubproblemResult,
) -> Vec<String> {
    let (services, day) = match instance {
        SubproblemInstance::Fat(i) => (&i.services, &i.day),
        SubproblemInstance::Slim(i) => (&i.services, &i.day),
    };
    let patient_exists = |name: &str| match instance {
        SubproblemInstance::Fat(i) => i.patients.contains_key(name),
        SubproblemInstance::Slim(i) => i.patients.contains_key(name),
    };

    let mut errors = Vec::new();

    for placement in result.scheduled() {
        if !patient_exists(&placement.patient) {
            errors.push(format!("patient {} does not exist", placement.patient));
        }
        let Some(service) = services.get(&placement.service) else {
            errors.push(format!("service {} does not exist", placement.service));
            continue;
        };
        let Some(operators) = day.care_unit(&service.care_unit) else {
            errors.push(format!("care unit {} does not exist", service.care_unit));
            continue;
        };
        let Some(operator) = operators.get(&placement.operator) else {
            errors.push(format!("operator {} does not exist", placement.operator));
            continue;
        };
        if !operator.covers(placement.time, service.duration) {
            errors.push(format!(
                "service {} of patient {} does not respect operator {} time of activity",
                placement.service, placement.patient, placement.operator
            ));
        }
    }

    // Every instance request appears in scheduled or rejected.
    let request_pairs: Vec<(String, String)> = match instance {
        SubproblemInstance::Fat(i) => i
            .patients
            .iter()
            .flat_map(|(p, patient)| {
                patient.requests.iter().map(move |r| (p.clone(), r.service.clone()))
            })
            .collect(),
        SubproblemInstance::Slim(i) => i
            .patients
            .iter()
            .flat_map(|(p, patient)| patient.requests.iter().map(move |s| (p.clone(), s.clone())))
            .collect(),
    };
    let rejected_slim = result.slim_rejected();
    for (patient, service) in &request_pairs {
        let in_rejected = rejected_slim
            .iter()
            .any(|r| &r.patient == patient && &r.service == service);
        let in_scheduled = result
            .scheduled()
            .iter()
            .any(|p| &p.patient == patient && &p.service == service);
        if !in_rejected && !in_scheduled {
            errors.push(format!(
                "patient {patient} does not have service {service} in the result"
            ));
        }
    }

    for rejected in &rejected_slim {
        if !patient_exists(&rejected.patient) {
            errors.push(format!("rejected patient {} does not exist", rejected.patient));
        }
        if !services.contains_key(&rejected.service) {
            errors.push(format!("rejected service {} does not exist", rejected.service));
        }
        if result
            .scheduled()
            .iter()
            .any(|p| p.patient == rejected.patient && p.service == rejected.service)
        {
            errors.push(format!(
                "patient {} has service {} both satisfied and rejected",
                rejected.patient, rejected.service
            ));
        }
    }

    errors.extend(check_overlaps(services, result.scheduled()));

    errors
}

// ============================================================================
// Final results
// ============================================================================

pub fn check_final_result(instance: &MasterInstance, result: &FinalResult) -> Vec<String> {
    let mut errors = check_fat_scheduled_references(instance, &result.scheduled);
    errors.extend(check_rejected_requests(instance, &result.rejected));
    errors.extend(check_fat_daily_loads(instance, &result.scheduled));
    errors.extend(check_windows_respect(instance, &result.scheduled, &result.rejected));

    for (day_name, placements) in &result.scheduled {
        for error in check_overlaps(&instance.services, placements) {
            errors.push(format!("[day {day_name}]: {error}"));
        }
        let Some(day) = instance.days.get(day_name) else {
            continue;
        };
        for placement in placements {
            let Some(service) = instance.services.get(&placement.service) else {
                continue;
            };
            let Some(operator) = day
                .care_unit(&service.care_unit)
                .and_then(|operators| operators.get(&placement.operator))
            else {
                continue;
            };
            if !operator.covers(placement.time, service.duration) {
                errors.push(format!(
                    "service {} of patient {} does not respect operator {} time of activity in day {day_name}",
                    placement.service, placement.patient, placement.operator
                ));
            }
        }
    }

    errors
}

// ============================================================================
// Cores
// ============================================================================

pub fn check_cores<C: RequestRef>(instance: &MasterInstance, cores: &[Core<C>]) -> Vec<String> {
    let mut errors = Vec::new();

    for core in cores {
        if core.reason.is_empty() {
            errors.push("a core has no reason".to_string());
        }
        if core.days.is_empty() {
            errors.push("a core has no days".to_string());
        }
        if core.components.is_empty() {
            errors.push("a core has no components".to_string());
        }

        for day_name in &core.days {
            if !instance.days.contains_key(day_name) {
                errors.push(format!("day {day_name} is not present in the instance"));
            }
        }

        for reason in &core.reason {
            let found = core.components.iter().any(|component| {
                component.same_slim(reason) && component.operator() == reason.operator()
            });
            if !found {
                match reason.operator() {
                    Some(operator) => errors.push(format!(
                        "reason ({}, {}, {operator}) not found in core components",
                        reason.patient(),
                        reason.service()
                    )),
                    None => errors.push(format!(
                        "reason ({}, {}) not found in core components",
                        reason.patient(),
                        reason.service()
                    )),
                }
            }
        }

        for component in &core.components {
            let patient = instance.patients.get(component.patient());
            if patient.is_none() {
                errors.push(format!("patient {} does not exist", component.patient()));
            }
            if !instance.services.contains_key(component.service()) {
                errors.push(format!("service {} does not exist", component.service()));
            }
            let windows = patient.and_then(|p| p.requests.get(component.service()));
            if patient.is_some() && windows.is_none() {
                errors.push(format!(
                    "service {} is not requested by patient {}",
                    component.service(),
                    component.patient()
                ));
            }

            for day_name in &core.days {
                if let Some(operator_name) = component.operator() {
                    let operator_exists = instance
                        .days
                        .get(day_name)
                        .is_some_and(|day| day.operator(operator_name).is_some());
                    if !operator_exists {
                        errors.push(format!(
                            "operator {operator_name} does not exist in day {day_name}"
                        ));
                    }
                }
                let window_found = windows
                    .is_some_and(|windows| windows.iter().any(|w| w.contains(*day_name)));
                if windows.is_some() && !window_found {
                    errors.push(format!(
                        "patient {} has no window for service {} in day {day_name}",
                        component.patient(),
                        component.service()
                    ));
                }
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Day, FatRequest, MasterPatient, Operator, SlimRequest, Window};
    use pretty_assertions::assert_eq;

    fn small_instance() -> MasterInstance {
        let mut instance = MasterInstance::default();
        instance.services.insert(
            "srv00".into(),
            Service { care_unit: "cu00".into(), duration: 4 },
        );
        let mut day = Day::default();
        day.add_operator("cu00", "op00", Operator { start: 0, duration: 10 });
        instance.days.insert(1, day);
        let mut patient = MasterPatient::new(1);
        patient.add_request("srv00", Window::new(1, 1));
        instance.patients.insert("pat00".into(), patient);
        instance
    }

    #[test]
    fn valid_instance_passes() {
        assert_eq!(check_master_instance(&small_instance()), Vec::<String>::new());
    }

    #[test]
    fn day_gaps_are_reported() {
        let mut instance = small_instance();
        let day = instance.days[&1].clone();
        instance.days.insert(3, day);
        let errors = check_master_instance(&instance);
        assert!(errors.iter().any(|e| e.contains("gaps")), "{errors:?}");
    }

    #[test]
    fn dangling_service_care_unit_is_reported() {
        let mut instance = small_instance();
        instance.services.get_mut("srv00").unwrap().care_unit = "cu99".into();
        let errors = check_master_instance(&instance);
        assert!(errors.iter().any(|e| e.contains("cu99")), "{errors:?}");
    }

    #[test]
    fn unsatisfied_window_is_reported() {
        let instance = small_instance();
        let result = FatMasterResult::default();
        let errors = check_fat_master_result(&instance, &result);
        assert!(
            errors.iter().any(|e| e.contains("neither scheduled nor rejected")),
            "{errors:?}"
        );
    }

    #[test]
    fn satisfied_window_passes() {
        let instance = small_instance();
        let mut result = FatMasterResult::default();
        result.scheduled.insert(
            1,
            vec![FatRequest {
                patient: "pat00".into(),
                service: "srv00".into(),
                operator: "op00".into(),
            }],
        );
        assert_eq!(check_fat_master_result(&instance, &result), Vec::<String>::new());
    }

    #[test]
    fn operator_overload_is_reported() {
        let mut instance = small_instance();
        let mut patient = MasterPatient::new(1);
        patient.add_request("srv00", Window::new(1, 1));
        instance.patients.insert("pat01".into(), patient);
        instance.services.insert(
            "srv01".into(),
            Service { care_unit: "cu00".into(), duration: 8 },
        );
        instance
            .patients
            .get_mut("pat01")
            .unwrap()
            .requests
            .insert("srv01".into(), vec![Window::new(1, 1)]);

        let mut result = FatMasterResult::default();
        result.scheduled.insert(
            1,
            vec![
                FatRequest {
                    patient: "pat00".into(),
                    service: "srv00".into(),
                    operator: "op00".into(),
                },
                FatRequest {
                    patient: "pat01".into(),
                    service: "srv00".into(),
                    operator: "op00".into(),
                },
                FatRequest {
                    patient: "pat01".into(),
                    service: "srv01".into(),
                    operator: "op00".into(),
                },
            ],
        );
        let errors = check_fat_master_result(&instance, &result);
        assert!(
            errors.iter().any(|e| e.contains("operator op00 is overloaded")),
            "{errors:?}"
        );
    }

    #[test]
    fn overlapping_placements_are_reported() {
        let instance = small_instance();
        let placements = vec![
            Placement {
                patient: "pat00".into(),
                service: "srv00".into(),
                operator: "op00".into(),
                time: 0,
            },
            Placement {
                patient: "pat01".into(),
                service: "srv00".into(),
                operator: "op00".into(),
                time: 2,
            },
        ];
        let errors = check_overlaps(&instance.services, &placements);
        assert!(errors.iter().any(|e| e.contains("overlap in time")), "{errors:?}");
    }

    #[test]
    fn disjoint_placements_pass() {
        let instance = small_instance();
        let placements = vec![
            Placement {
                patient: "pat00".into(),
                service: "srv00".into(),
                operator: "op00".into(),
                time: 0,
            },
            Placement {
                patient: "pat01".into(),
                service: "srv00".into(),
                operator: "op00".into(),
                time: 4,
            },
        ];
        assert_eq!(check_overlaps(&instance.services, &placements), Vec::<String>::new());
    }

    #[test]
    fn core_reason_must_be_component() {
        let instance = small_instance();
        let core = crate::SlimCore {
            days: vec![1],
            reason: vec![SlimRequest { patient: "pat00".into(), service: "srv00".into() }],
            components: vec![SlimRequest { patient: "pat99".into(), service: "srv00".into() }],
        };
        let errors = check_cores(&instance, &[core]);
        assert!(errors.iter().any(|e| e.contains("not found in core components")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("pat99 does not exist")), "{errors:?}");
    }

    #[test]
    fn core_day_needs_covering_window() {
        let mut instance = small_instance();
        let day = instance.days[&1].clone();
        instance.days.insert(2, day);
        let request = SlimRequest { patient: "pat00".into(), service: "srv00".into() };
        let core = crate::SlimCore {
            days: vec![2],
            reason: vec![request.clone()],
            components: vec![request],
        };
        let errors = check_cores(&instance, &[core]);
        assert!(errors.iter().any(|e| e.contains("no window")), "{errors:?}");
    }
}
