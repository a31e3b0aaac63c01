//! Result valuation.
//!
//! The driver compares master bounds, cache candidates and composed final
//! results through a single measure: the sum of `duration · priority` over
//! window obligations satisfied by the scheduled days, minus the optional
//! hospital-access penalty. The value is computed from the result itself,
//! never from a solver objective, so optimistic and realised schedules are
//! measured with the same yardstick.

use crate::{DayName, MasterInstance, PatientName, RequestRef};
use std::collections::{BTreeMap, BTreeSet};

/// Number of distinct (patient, day) pairs used by a schedule.
pub fn days_used_by_patients<R: RequestRef>(scheduled: &BTreeMap<DayName, Vec<R>>) -> usize {
    let mut used: BTreeMap<&str, BTreeSet<DayName>> = BTreeMap::new();
    for (day_name, requests) in scheduled {
        for request in requests {
            used.entry(request.patient()).or_default().insert(*day_name);
        }
    }
    used.values().map(BTreeSet::len).sum()
}

/// Worst-case number of (patient, day) pairs: every patient visits on every
/// day of every window. Normalises the hospital-access penalty so it always
/// stays below one priority-weighted time slot.
pub fn worst_case_day_number(instance: &MasterInstance) -> usize {
    let mut used: BTreeMap<&PatientName, BTreeSet<DayName>> = BTreeMap::new();
    for (patient_name, patient) in &instance.patients {
        for (_, window) in patient.windows() {
            used.entry(patient_name).or_default().extend(window.days());
        }
    }
    used.values().map(BTreeSet::len).sum()
}

/// Weighted satisfied duration of a schedule, with the optional
/// minimize-hospital-accesses penalty.
///
/// An obligation counts as satisfied when any day inside its window carries
/// a scheduled request with the same (patient, service).
pub fn result_value<R: RequestRef>(
    instance: &MasterInstance,
    scheduled: &BTreeMap<DayName, Vec<R>>,
    minimize_hospital_accesses: bool,
    worst_case_days: usize,
) -> f64 {
    let mut value = 0i64;

    for (patient_name, patient) in &instance.patients {
        for (service_name, windows) in &patient.requests {
            let Some(service) = instance.services.get(service_name) else {
                continue;
            };
            for window in windows {
                let satisfied = window.days().any(|day| {
                    scheduled.get(&day).is_some_and(|requests| {
                        requests.iter().any(|r| {
                            r.patient() == patient_name && r.service() == service_name
                        })
                    })
                });
                if satisfied {
                    value += i64::from(service.duration) * i64::from(patient.priority);
                }
            }
        }
    }

    let mut value = value as f64;
    if minimize_hospital_accesses && worst_case_days > 0 {
        value -= days_used_by_patients(scheduled) as f64 / worst_case_days as f64;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Day, MasterPatient, Operator, Service, SlimRequest, Window};
    use pretty_assertions::assert_eq;

    fn instance_with_two_patients() -> MasterInstance {
        let mut instance = MasterInstance::default();
        instance.services.insert(
            "srv00".into(),
            Service { care_unit: "cu00".into(), duration: 4 },
        );
        for day_name in 1..=2 {
            let mut day = Day::default();
            day.add_operator("cu00", "op00", Operator { start: 0, duration: 10 });
            instance.days.insert(day_name, day);
        }
        for (name, priority) in [("pat00", 1), ("pat01", 3)] {
            let mut patient = MasterPatient::new(priority);
            patient.add_request("srv00", Window::new(1, 2));
            instance.patients.insert(name.into(), patient);
        }
        instance
    }

    fn slim(patient: &str) -> SlimRequest {
        SlimRequest { patient: patient.into(), service: "srv00".into() }
    }

    #[test]
    fn value_weighs_priority_and_duration() {
        let instance = instance_with_two_patients();
        let mut scheduled = BTreeMap::new();
        scheduled.insert(1, vec![slim("pat00")]);
        scheduled.insert(2, vec![slim("pat01")]);
        assert_eq!(result_value(&instance, &scheduled, false, 0), 16.0);
    }

    #[test]
    fn window_counts_once_even_if_satisfied_twice() {
        let instance = instance_with_two_patients();
        let mut scheduled = BTreeMap::new();
        scheduled.insert(1, vec![slim("pat00")]);
        scheduled.insert(2, vec![slim("pat00")]);
        assert_eq!(result_value(&instance, &scheduled, false, 0), 4.0);
    }

    #[test]
    fn access_penalty_stays_fractional() {
        let instance = instance_with_two_patients();
        let worst = worst_case_day_number(&instance);
        assert_eq!(worst, 4);
        let mut scheduled = BTreeMap::new();
        scheduled.insert(1, vec![slim("pat00"), slim("pat01")]);
        let value = result_value(&instance, &scheduled, true, worst);
        assert_eq!(value, 16.0 - 2.0 / 4.0);
    }
}
