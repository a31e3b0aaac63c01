//! Monolithic reference model.
//!
//! One MILP over the whole horizon: assignment binaries per
//! (patient, service, day, operator) and one start-time integer per window
//! obligation. Used to validate and benchmark the decomposition — its
//! objective on the reference scenarios must match the decomposed final
//! value. The patient disjunction is stated per window pair, so a patient's
//! two obligations are time-separated even when placed on different days;
//! the bound is conservative but sound, and it is the established
//! reference formulation.

use crate::milp::{LinearExpr, Model, Relation, SolveLimits, SolveOutcome, VarId};
use caresched_core::{
    DayName, FinalResult, MasterInstance, PatientName, Placement, ServiceName, TimeSlot, Window,
    WindowRequest,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Options mirrored from the master phase's `additional_info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonolithicOptions {
    pub minimize_hospital_accesses: bool,
    pub use_redundant_operator_cut: bool,
    pub use_redundant_patient_cut: bool,
}

type WindowKey = (PatientName, ServiceName, Window);
type DoKey = (PatientName, ServiceName, DayName, String);

pub struct MonolithicModel {
    model: Model,
    window_vars: Vec<(WindowKey, VarId)>,
    do_vars: Vec<(DoKey, VarId)>,
}

impl MonolithicModel {
    pub fn build(instance: &MasterInstance, options: &MonolithicOptions) -> Self {
        let mut window_index: BTreeSet<WindowKey> = BTreeSet::new();
        let mut do_index: BTreeSet<DoKey> = BTreeSet::new();
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
                        for operator in operators.keys() {
                            do_index.insert((
                                patient_name.clone(),
                                service_name.clone(),
                                day,
                                operator.clone(),
                            ));
                            pat_days.insert((patient_name.clone(), day));
                        }
                    }
                }
            }
        }

        // max_time[d][cu] is the big-M of every disjunction on day d.
        let mut max_time: BTreeMap<DayName, BTreeMap<&str, TimeSlot>> = BTreeMap::new();
        for (day_name, day) in &instance.days {
            let per_unit = max_time.entry(*day_name).or_default();
            for care_unit in day.care_units().keys() {
                if let Some(end) = day.max_end(care_unit) {
                    per_unit.insert(care_unit.as_str(), end + 1);
                }
            }
        }

        let mut model = Model::new();

        let do_vars: Vec<(DoKey, VarId)> =
            do_index.iter().map(|key| (key.clone(), model.binary())).collect();
        let do_lookup: HashMap<&DoKey, VarId> =
            do_vars.iter().map(|(key, var)| (key, *var)).collect();

        let window_time_upper = |patient: &str, service: &str, window: &Window| -> TimeSlot {
            let duration = instance.services[service].duration;
            do_vars
                .iter()
                .filter(|((p, s, d, _), _)| p == patient && s == service && window.contains(*d))
                .filter_map(|((_, s, d, o), _)| {
                    let care_unit = instance.care_unit_of(s)?;
                    let operator = instance.days[d].care_unit(care_unit)?.get(o)?;
                    Some(operator.end() - duration + 1)
                })
                .max()
                .unwrap_or(0)
                .max(0)
        };

        let window_vars: Vec<(WindowKey, VarId)> = window_index
            .iter()
            .map(|key| {
                let upper = window_time_upper(&key.0, &key.1, &key.2);
                (key.clone(), model.integer(0, upper))
            })
            .collect();
        let time_lookup: HashMap<&WindowKey, VarId> =
            window_vars.iter().map(|(key, var)| (key, *var)).collect();

        let window_dos = |patient: &str, service: &str, window: &Window| -> Vec<(&DoKey, VarId)> {
            do_vars
                .iter()
                .filter(|((p, s, d, _), _)| p == patient && s == service && window.contains(*d))
                .map(|(key, var)| (key, *var))
                .collect()
        };

        for ((patient, service, window), time_var) in &window_vars {
            let duration = instance.services[service].duration;
            let care_unit = instance.care_unit_of(service).unwrap_or_default();
            let dos = window_dos(patient, service, window);

            // Each window is satisfied at most once.
            let mut at_most_once = LinearExpr::new();
            for (_, var) in &dos {
                at_most_once.add_term(*var, 1);
            }
            model.constrain(at_most_once, Relation::Le, 1);

            // Start time bracketed by the chosen operator's shift; zero
            // when the window is unsatisfied.
            let mut lower = LinearExpr::new().term(*time_var, -1);
            let mut upper = LinearExpr::new().term(*time_var, 1);
            for ((_, _, day, operator_name), var) in &dos {
                let operator = instance.days[day]
                    .care_unit(care_unit)
                    .and_then(|ops| ops.get(operator_name));
                let Some(operator) = operator else {
                    continue;
                };
                lower.add_term(*var, i64::from(operator.start + 1));
                upper.add_term(*var, -i64::from(operator.end() - duration + 1));
            }
            model.constrain(lower, Relation::Le, 0);
            model.constrain(upper, Relation::Le, 0);
        }

        // Patient disjunction over overlapping window pairs.
        let windows: Vec<&WindowKey> = window_index.iter().collect();
        for i in 0..windows.len() {
            for j in (i + 1)..windows.len() {
                let (first, second) = (windows[i], windows[j]);
                if first.0 != second.0 || !first.2.overlaps(&second.2) {
                    continue;
                }
                let duration_first = i64::from(instance.services[&first.1].duration);
                let duration_second = i64::from(instance.services[&second.1].duration);
                let unit_first = instance.care_unit_of(&first.1).unwrap_or_default();
                let unit_second = instance.care_unit_of(&second.1).unwrap_or_default();
                let time_first = time_lookup[first];
                let time_second = time_lookup[second];
                let dos_first = window_dos(&first.0, &first.1, &first.2);
                let dos_second = window_dos(&second.0, &second.1, &second.2);

                let shared_start = first.2.start.max(second.2.start);
                let shared_end = first.2.end.min(second.2.end);
                for day in shared_start..=shared_end {
                    let (Some(m_first), Some(m_second)) = (
                        max_time.get(&day).and_then(|m| m.get(unit_first)).copied(),
                        max_time.get(&day).and_then(|m| m.get(unit_second)).copied(),
                    ) else {
                        continue;
                    };
                    let overlap = model.binary();
                    let mut forward = LinearExpr::new()
                        .term(time_first, 1)
                        .term(time_second, -1)
                        .term(overlap, i64::from(m_first));
                    for (_, var) in &dos_first {
                        forward.add_term(*var, duration_first);
                    }
                    model.constrain(forward, Relation::Le, i64::from(m_first));

                    let mut backward = LinearExpr::new()
                        .term(time_second, 1)
                        .term(time_first, -1)
                        .term(overlap, -i64::from(m_second));
                    for (_, var) in &dos_second {
                        backward.add_term(*var, duration_second);
                    }
                    model.constrain(backward, Relation::Le, 0);

                    let mut bound = LinearExpr::new().term(overlap, 1);
                    for (_, var) in &dos_second {
                        bound.add_term(*var, -1);
                    }
                    model.constrain(bound, Relation::Le, 0);

                    let mut force = LinearExpr::new().term(overlap, -1);
                    for (_, var) in &dos_second {
                        force.add_term(*var, 1);
                    }
                    for (_, var) in &dos_first {
                        force.add_term(*var, -1);
                    }
                    model.constrain(force, Relation::Le, 0);
                }
            }
        }

        // Operator disjunction over same-care-unit window pairs.
        for i in 0..windows.len() {
            for j in (i + 1)..windows.len() {
                let (first, second) = (windows[i], windows[j]);
                let unit_first = instance.care_unit_of(&first.1).unwrap_or_default();
                let unit_second = instance.care_unit_of(&second.1).unwrap_or_default();
                if unit_first != unit_second || !first.2.overlaps(&second.2) {
                    continue;
                }
                let duration_first = i64::from(instance.services[&first.1].duration);
                let duration_second = i64::from(instance.services[&second.1].duration);
                let time_first = time_lookup[first];
                let time_second = time_lookup[second];

                let shared_start = first.2.start.max(second.2.start);
                let shared_end = first.2.end.min(second.2.end);
                for day in shared_start..=shared_end {
                    let Some(big_m) =
                        max_time.get(&day).and_then(|m| m.get(unit_first)).copied()
                    else {
                        continue;
                    };
                    let Some(operators) =
                        instance.days.get(&day).and_then(|d| d.care_unit(unit_first))
                    else {
                        continue;
                    };
                    for operator_name in operators.keys() {
                        let key_first =
                            (first.0.clone(), first.1.clone(), day, operator_name.clone());
                        let key_second =
                            (second.0.clone(), second.1.clone(), day, operator_name.clone());
                        let (Some(do_first), Some(do_second)) =
                            (do_lookup.get(&key_first), do_lookup.get(&key_second))
                        else {
                            continue;
                        };
                        if do_first == do_second {
                            continue;
                        }

                        let overlap_first = model.binary();
                        let overlap_second = model.binary();
                        model.constrain(
                            LinearExpr::new()
                                .term(time_first, 1)
                                .term(*do_first, duration_first)
                                .term(time_second, -1)
                                .term(overlap_first, i64::from(big_m)),
                            Relation::Le,
                            i64::from(big_m),
                        );
                        model.constrain(
                            LinearExpr::new()
                                .term(time_second, 1)
                                .term(*do_second, duration_second)
                                .term(time_first, -1)
                                .term(overlap_second, i64::from(big_m)),
                            Relation::Le,
                            i64::from(big_m),
                        );
                        model.constrain(
                            LinearExpr::new()
                                .term(*do_first, 1)
                                .term(*do_second, 1)
                                .term(overlap_first, -1)
                                .term(overlap_second, -1),
                            Relation::Le,
                            1,
                        );
                        model.constrain(
                            LinearExpr::new()
                                .term(overlap_first, 1)
                                .term(overlap_second, 1)
                                .term(*do_first, -1),
                            Relation::Le,
                            0,
                        );
                        model.constrain(
                            LinearExpr::new()
                                .term(overlap_first, 1)
                                .term(overlap_second, 1)
                                .term(*do_second, -1),
                            Relation::Le,
                            0,
                        );
                    }
                }
            }
        }

        if options.use_redundant_operator_cut {
            for (day_name, day) in &instance.days {
                for (operator_name, _, operator) in day.operators() {
                    let affected: Vec<(&DoKey, VarId)> = do_vars
                        .iter()
                        .filter(|((_, _, d, o), _)| d == day_name && o == operator_name)
                        .map(|(key, var)| (key, *var))
                        .collect();
                    let total: i64 = affected
                        .iter()
                        .map(|((_, s, _, _), _)| i64::from(instance.services[s].duration))
                        .sum();
                    if affected.is_empty() || total <= i64::from(operator.duration) {
                        continue;
                    }
                    let mut expr = LinearExpr::new();
                    for ((_, s, _, _), var) in affected {
                        expr.add_term(var, i64::from(instance.services[s].duration));
                    }
                    model.constrain(expr, Relation::Le, i64::from(operator.duration));
                }
            }
        }

        if options.use_redundant_patient_cut {
            for (patient_name, day_name) in &pat_days {
                let affected: Vec<(&DoKey, VarId)> = do_vars
                    .iter()
                    .filter(|((p, _, d, _), _)| p == patient_name && d == day_name)
                    .map(|(key, var)| (key, *var))
                    .collect();
                let max_span = instance.days[day_name].max_span();
                let total: i64 = affected
                    .iter()
                    .map(|((_, s, _, _), _)| i64::from(instance.services[s].duration))
                    .sum();
                if affected.is_empty() || total <= i64::from(max_span) {
                    continue;
                }
                let mut expr = LinearExpr::new();
                for ((_, s, _, _), var) in affected {
                    expr.add_term(var, i64::from(instance.services[s].duration));
                }
                model.constrain(expr, Relation::Le, i64::from(max_span));
            }
        }

        // Objective over assignments, optionally with the integral
        // hospital-access penalty.
        let scale =
            if options.minimize_hospital_accesses { pat_days.len().max(1) as i64 } else { 1 };
        let mut objective = LinearExpr::new();
        for ((patient, service, _, _), var) in &do_vars {
            let duration = i64::from(instance.services[service].duration);
            let priority = i64::from(instance.patients[patient].priority);
            objective.add_term(*var, duration * priority * scale);
        }
        if options.minimize_hospital_accesses {
            for (patient_name, day_name) in &pat_days {
                let uses_day = model.binary();
                let mut by_service: BTreeMap<&ServiceName, Vec<VarId>> = BTreeMap::new();
                for ((p, s, d, _), var) in &do_vars {
                    if p == patient_name && d == day_name {
                        by_service.entry(s).or_default().push(*var);
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

        Self { model, window_vars, do_vars }
    }

    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        self.model.solve(limits)
    }

    pub fn extract(&self, outcome: &SolveOutcome) -> FinalResult {
        let mut result = FinalResult::default();

        for ((patient, service, day, operator), var) in &self.do_vars {
            if !outcome.is_set(*var) {
                continue;
            }
            let time = self
                .window_vars
                .iter()
                .find(|((p, s, window), _)| {
                    p == patient && s == service && window.contains(*day)
                })
                .map(|(_, time_var)| outcome.value(*time_var) - 1);
            if let Some(time) = time {
                result.scheduled.entry(*day).or_default().push(Placement {
                    patient: patient.clone(),
                    service: service.clone(),
                    operator: operator.clone(),
                    time,
                });
            }
        }

        for ((patient, service, window), time_var) in &self.window_vars {
            if outcome.value(*time_var) < 1 {
                result.rejected.push(WindowRequest {
                    patient: patient.clone(),
                    service: service.clone(),
                    window: *window,
                });
            }
        }

        for placements in result.scheduled.values_mut() {
            placements.sort();
        }
        result.rejected.sort();
        result
    }

    pub fn size(&self) -> (usize, usize) {
        (self.model.var_count(), self.model.constraint_count())
    }
}
