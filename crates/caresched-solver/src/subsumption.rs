//! Day subsumption: a per-care-unit partial order `d_big ≽ d_small` holding
//! when every packing of a day shaped like `d_small` embeds into `d_big`.
//!
//! The test is a small matching MILP: assign each small-day operator to a
//! big-day operator whose shift contains it, where two time-overlapping
//! small operators may not share a big operator. The relation is closed
//! transitively in memory and consumed by day expansion.

use crate::milp::{LinearExpr, Model, Relation, SolveLimits, SolveStatus};
use caresched_core::{CareUnitName, DayName, MasterInstance, Operator, OperatorName};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// For each care unit, the set of days every day subsumes.
pub type Subsumptions = BTreeMap<CareUnitName, BTreeMap<DayName, BTreeSet<DayName>>>;

/// Whether every `small` operator embeds injectively (up to time-disjoint
/// sharing) into the `big` operators.
fn day_subsumes(
    big: &BTreeMap<OperatorName, Operator>,
    small: &BTreeMap<OperatorName, Operator>,
    limits: &SolveLimits,
) -> bool {
    let mut arcs: Vec<(&OperatorName, &OperatorName)> = Vec::new();
    for (big_name, big_op) in big {
        for (small_name, small_op) in small {
            if small_op.start >= big_op.start && small_op.end() <= big_op.end() {
                arcs.push((small_name, big_name));
            }
        }
    }

    let mut model = Model::new();
    let arc_vars: Vec<(&OperatorName, &OperatorName, crate::milp::VarId)> =
        arcs.iter().map(|(s, b)| (*s, *b, model.binary())).collect();

    for small_name in small.keys() {
        let mut expr = LinearExpr::new();
        for (s, _, var) in &arc_vars {
            if *s == small_name {
                expr.add_term(*var, 1);
            }
        }
        if !expr.is_empty() {
            model.constrain(expr, Relation::Le, 1);
        }
    }

    // Overlapping small operators must land on distinct big operators.
    for (first_name, first) in small {
        for (second_name, second) in small {
            if first_name == second_name {
                continue;
            }
            let overlapping = (first.start <= second.start && first.end() >= second.start)
                || (second.start <= first.start && second.end() >= first.start);
            if !overlapping {
                continue;
            }
            for big_name in big.keys() {
                let first_arc = arc_vars
                    .iter()
                    .find(|(s, b, _)| *s == first_name && *b == big_name);
                let second_arc = arc_vars
                    .iter()
                    .find(|(s, b, _)| *s == second_name && *b == big_name);
                if let (Some((_, _, first_var)), Some((_, _, second_var))) =
                    (first_arc, second_arc)
                {
                    model.constrain(
                        LinearExpr::new().term(*first_var, 1).term(*second_var, 1),
                        Relation::Le,
                        1,
                    );
                }
            }
        }
    }

    let mut objective = LinearExpr::new();
    for (_, _, var) in &arc_vars {
        objective.add_term(*var, 1);
    }
    model.maximize(objective);

    let outcome = model.solve(limits);
    if outcome.status != SolveStatus::Optimal {
        return false;
    }

    small.keys().all(|small_name| {
        arc_vars
            .iter()
            .any(|(s, _, var)| *s == small_name && outcome.is_set(*var))
    })
}

/// Compute the subsumed-day sets of every (care unit, day), closed
/// transitively.
pub fn compute_subsumptions(instance: &MasterInstance, limits: &SolveLimits) -> Subsumptions {
    let mut care_unit_names: BTreeSet<&CareUnitName> = BTreeSet::new();
    for day in instance.days.values() {
        care_unit_names.extend(day.care_units().keys());
    }

    let mut subsumptions: Subsumptions = BTreeMap::new();
    for care_unit in care_unit_names {
        let per_day = subsumptions.entry(care_unit.clone()).or_default();

        for (big_name, big_day) in &instance.days {
            let Some(big_operators) = big_day.care_unit(care_unit) else {
                continue;
            };
            let smaller = per_day.entry(*big_name).or_default();

            for (small_name, small_day) in &instance.days {
                if big_name == small_name || smaller.contains(small_name) {
                    continue;
                }
                let Some(small_operators) = small_day.care_unit(care_unit) else {
                    continue;
                };
                if day_subsumes(big_operators, small_operators, limits) {
                    smaller.insert(*small_name);
                }
            }
        }

        // Transitive closure to fixpoint.
        loop {
            let mut grew = false;
            let snapshot = per_day.clone();
            for smaller in per_day.values_mut() {
                let reachable: BTreeSet<DayName> = smaller
                    .iter()
                    .filter_map(|day| snapshot.get(day))
                    .flatten()
                    .copied()
                    .collect();
                for day in reachable {
                    grew |= smaller.insert(day);
                }
            }
            if !grew {
                break;
            }
        }
    }

    debug!(care_units = subsumptions.len(), "subsumption relation computed");
    subsumptions
}

/// Days that subsume `day` in every care unit of `affected`: candidates
/// for replicating a core extracted on `day`.
pub fn subsuming_days(
    subsumptions: &Subsumptions,
    affected: &BTreeSet<CareUnitName>,
    day: DayName,
) -> BTreeSet<DayName> {
    let mut result: Option<BTreeSet<DayName>> = None;
    for care_unit in affected {
        let Some(per_day) = subsumptions.get(care_unit) else {
            return BTreeSet::new();
        };
        let bigger: BTreeSet<DayName> = per_day
            .iter()
            .filter(|(_, smaller)| smaller.contains(&day))
            .map(|(big, _)| *big)
            .collect();
        result = Some(match result {
            None => bigger,
            Some(current) => current.intersection(&bigger).copied().collect(),
        });
    }
    result.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use caresched_core::Day;
    use pretty_assertions::assert_eq;

    fn instance_with_days(days: &[(DayName, &[(&str, i32, i32)])]) -> MasterInstance {
        let mut instance = MasterInstance::default();
        for (day_name, operators) in days {
            let mut day = Day::default();
            for (name, start, duration) in *operators {
                day.add_operator("cu00", *name, Operator { start: *start, duration: *duration });
            }
            instance.days.insert(*day_name, day);
        }
        instance
    }

    #[test]
    fn wide_shift_subsumes_contained_shift() {
        // Day 1 has [0, 10], day 2 has [2, 6]: day 1 subsumes day 2.
        let instance =
            instance_with_days(&[(1, &[("op00", 0, 10)]), (2, &[("op01", 2, 4)])]);
        let subsumptions = compute_subsumptions(&instance, &SolveLimits::seconds(10.0));

        let cu = &subsumptions["cu00"];
        assert_eq!(cu[&1], BTreeSet::from([2]));
        assert_eq!(cu[&2], BTreeSet::new());

        let affected = BTreeSet::from(["cu00".to_string()]);
        assert_eq!(subsuming_days(&subsumptions, &affected, 2), BTreeSet::from([1]));
        assert_eq!(subsuming_days(&subsumptions, &affected, 1), BTreeSet::new());
    }

    #[test]
    fn overlapping_operators_cannot_share_a_target() {
        // Two overlapping [0, 4] operators cannot both embed into one
        // [0, 8] operator, but do embed into two of them.
        let cramped =
            instance_with_days(&[(1, &[("op00", 0, 8)]), (2, &[("op01", 0, 4), ("op02", 0, 4)])]);
        let subsumptions = compute_subsumptions(&cramped, &SolveLimits::seconds(10.0));
        assert!(subsumptions["cu00"][&1].is_empty());

        let roomy = instance_with_days(&[
            (1, &[("op00", 0, 8), ("op01", 0, 8)]),
            (2, &[("op02", 0, 4), ("op03", 0, 4)]),
        ]);
        let subsumptions = compute_subsumptions(&roomy, &SolveLimits::seconds(10.0));
        assert_eq!(subsumptions["cu00"][&1], BTreeSet::from([2]));
    }

    #[test]
    fn closure_is_transitive() {
        let instance = instance_with_days(&[
            (1, &[("op00", 0, 10)]),
            (2, &[("op01", 1, 6)]),
            (3, &[("op02", 2, 3)]),
        ]);
        let subsumptions = compute_subsumptions(&instance, &SolveLimits::seconds(10.0));
        let cu = &subsumptions["cu00"];
        assert!(cu[&1].contains(&2));
        assert!(cu[&2].contains(&3));
        assert!(cu[&1].contains(&3));
    }
}
