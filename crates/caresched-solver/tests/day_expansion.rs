//! Day expansion through the subsumption order.
//!
//! Day 1 carries a [0, 10] operator, day 2 a [2, 6] one: day 1 subsumes
//! day 2, so a core extracted on day 2 is also emitted for day 1.

use caresched_core::{
    Day, MasterInstance, MasterPatient, Operator, Service, SlimCore, SlimRequest, Window,
};
use caresched_solver::cores::Cores;
use caresched_solver::expansion::{expand_cores, AllPossibleRequests};
use caresched_solver::subsumption::{compute_subsumptions, subsuming_days};
use caresched_solver::{SolveLimits, SolverConfig};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

fn two_day_instance() -> MasterInstance {
    let mut instance = MasterInstance::default();
    instance
        .services
        .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });

    let mut wide = Day::default();
    wide.add_operator("cu00", "op00", Operator { start: 0, duration: 10 });
    instance.days.insert(1, wide);
    let mut narrow = Day::default();
    narrow.add_operator("cu00", "op01", Operator { start: 2, duration: 4 });
    instance.days.insert(2, narrow);

    for name in ["pat00", "pat01"] {
        let mut patient = MasterPatient::new(1);
        patient.add_request("srv00", Window::new(1, 2));
        instance.patients.insert(name.into(), patient);
    }
    instance
}

fn slim(patient: &str) -> SlimRequest {
    SlimRequest { patient: patient.into(), service: "srv00".into() }
}

#[test]
fn subsumption_orders_the_two_days() {
    let instance = two_day_instance();
    let subsumptions = compute_subsumptions(&instance, &SolveLimits::seconds(10.0));

    assert_eq!(subsumptions["cu00"][&1], BTreeSet::from([2]));
    assert_eq!(subsumptions["cu00"][&2], BTreeSet::new());

    let affected = BTreeSet::from(["cu00".to_string()]);
    assert_eq!(subsuming_days(&subsumptions, &affected, 2), BTreeSet::from([1]));
}

#[test]
fn core_on_the_small_day_is_replicated_to_the_subsuming_day() {
    let instance = two_day_instance();
    let subsumptions = compute_subsumptions(&instance, &SolveLimits::seconds(10.0));

    let core = SlimCore {
        days: vec![2],
        reason: vec![slim("pat00")],
        components: vec![slim("pat00"), slim("pat01")],
    };
    let config = SolverConfig {
        core_day_expansion: true,
        max_single_core_expansion: 10,
        ..SolverConfig::default()
    };
    let possible = AllPossibleRequests::for_structure(&instance, false);

    let expanded = expand_cores(
        &Cores::Slim(vec![core.clone()]),
        &possible,
        &instance.services,
        &config,
        Some(&subsumptions),
    );

    let Cores::Slim(expanded) = expanded else {
        panic!("slim cores expected");
    };
    // Identity renaming on both target days: the original day 2 plus the
    // subsuming day 1.
    let days: BTreeSet<i32> =
        expanded.iter().flat_map(|core| core.days.iter().copied()).collect();
    assert_eq!(days, BTreeSet::from([1, 2]));
    for replica in &expanded {
        assert!(replica.has_same_components(&core));
    }
}

#[test]
fn without_day_expansion_only_the_original_day_remains() {
    let instance = two_day_instance();
    let core = SlimCore {
        days: vec![2],
        reason: vec![slim("pat00")],
        components: vec![slim("pat00"), slim("pat01")],
    };
    let config = SolverConfig {
        max_single_core_expansion: 10,
        ..SolverConfig::default()
    };
    let possible = AllPossibleRequests::for_structure(&instance, false);

    let expanded = expand_cores(
        &Cores::Slim(vec![core]),
        &possible,
        &instance.services,
        &config,
        None,
    );
    let Cores::Slim(expanded) = expanded else {
        panic!("slim cores expected");
    };
    assert_eq!(expanded.len(), 1);
    assert_eq!(expanded[0].days, vec![2]);
}
