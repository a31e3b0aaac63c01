//! End-to-end runs of the decomposition driver on hand-built instances.
//!
//! Covers the reference scenarios: a trivially satisfiable instance, a
//! genuine master/subproblem relaxation gap closed by a core cut, the
//! monolithic reference agreeing with the decomposed optimum, and the
//! approximation early stop.

use caresched_core::{Day, MasterInstance, MasterPatient, Operator, Service, SlimCore, Window};
use caresched_solver::{
    solve_monolithic, InstanceDriver, OutputLayout, SolverConfig, StepOutcome, StopReason,
    StructureType,
};
use pretty_assertions::assert_eq;

fn trivial_instance() -> MasterInstance {
    let mut instance = MasterInstance::default();
    instance
        .services
        .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });
    let mut day = Day::default();
    day.add_operator("cu00", "op00", Operator { start: 0, duration: 10 });
    instance.days.insert(1, day);
    let mut patient = MasterPatient::new(1);
    patient.add_request("srv00", Window::new(1, 1));
    instance.patients.insert("pat00".into(), patient);
    instance
}

/// Three duration-4 requests against two 6-slot operators: the master's
/// capacity and span aggregates accept all three (12 ≤ 12), but no packing
/// places more than two.
fn gap_instance() -> MasterInstance {
    let mut instance = MasterInstance::default();
    instance
        .services
        .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });
    let mut day = Day::default();
    day.add_operator("cu00", "op00", Operator { start: 0, duration: 6 });
    day.add_operator("cu00", "op01", Operator { start: 0, duration: 6 });
    instance.days.insert(1, day);
    for index in 0..3 {
        let mut patient = MasterPatient::new(1);
        patient.add_request("srv00", Window::new(1, 1));
        instance.patients.insert(format!("pat{index:02}"), patient);
    }
    instance
}

fn config(structure: StructureType) -> SolverConfig {
    SolverConfig {
        structure_type: structure,
        max_iteration: 10,
        ..SolverConfig::default()
    }
}

#[test]
fn trivial_instance_stops_fully_satisfied_in_one_iteration() {
    let instance = trivial_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut driver =
        InstanceDriver::new(&instance, config(StructureType::SlimFat), layout, None).unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.stop, StopReason::FullySatisfied);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.best_final_value, Some(4.0));

    let run = dir.path().join("run");
    assert!(run.join("iter_1/master_result.json").exists());
    assert!(run.join("iter_1/final_result.json").exists());
    assert!(run.join("best_final_result_so_far.json").exists());
    // No rejection, no cores.
    assert!(!run.join("iter_1/basic_cores.json").exists());
    assert!(!run.join("iter_1/generalist_cores.json").exists());
}

#[test]
fn relaxation_gap_produces_core_then_converges() {
    let instance = gap_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut driver =
        InstanceDriver::new(&instance, config(StructureType::SlimFat), layout, None).unwrap();

    // Iteration 1: master accepts all three, the packing rejects one.
    assert_eq!(driver.step().unwrap(), StepOutcome::Continue);
    assert_eq!(driver.best_final_value(), Some(8.0));
    let cores: Vec<SlimCore> = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("run/iter_1/basic_cores.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(cores.len(), 1);
    assert_eq!(cores[0].days, vec![1]);
    assert_eq!(cores[0].reason.len(), 1);
    assert_eq!(cores[0].components.len(), 3);

    // Iteration 2: the cut makes the master drop one request; the packing
    // then satisfies everything the master kept.
    assert_eq!(
        driver.step().unwrap(),
        StepOutcome::Stopped(StopReason::FullySatisfied)
    );
    assert_eq!(driver.best_final_value(), Some(8.0));
    assert_eq!(driver.iteration(), 2);
}

#[test]
fn fat_master_closes_the_gap_without_cores() {
    // With operators pinned, the per-operator capacity already caps the
    // master at two requests; the first packing realises the bound.
    let instance = gap_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut driver =
        InstanceDriver::new(&instance, config(StructureType::FatSlim), layout, None).unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.iterations, 1);
    assert_eq!(report.best_final_value, Some(8.0));
}

#[test]
fn forgetful_fat_run_with_preemptive_forbidding_converges() {
    let instance = gap_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut config = config(StructureType::FatFat);
    config.subproblem.additional_info = vec!["preemptive_forbidding".to_string()];

    let mut driver = InstanceDriver::new(&instance, config, layout, None).unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.iterations, 1);
    assert_eq!(report.best_final_value, Some(8.0));
}

#[test]
fn pruned_pipeline_converges_like_basic() {
    let instance = gap_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut config = config(StructureType::SlimFat);
    config.core_type = caresched_solver::CoreType::Pruned;
    config.post_pruning_irreducibility = true;

    let mut driver = InstanceDriver::new(&instance, config, layout, None).unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.stop, StopReason::FullySatisfied);
    assert_eq!(report.best_final_value, Some(8.0));
    let run = dir.path().join("run");
    assert!(run.join("iter_1/basic_cores.json").exists());
    assert!(run.join("iter_1/reduced_cores.json").exists());
    assert!(run.join("iter_1/pruned_cores.json").exists());
}

#[test]
fn monolithic_reference_agrees_with_decomposition() {
    let instance = gap_instance();

    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("monolithic"));
    let config = SolverConfig {
        structure_type: StructureType::Monolithic,
        ..SolverConfig::default()
    };
    let report = solve_monolithic(&instance, &config, &layout, None).unwrap();
    assert_eq!(report.best_final_value, Some(8.0));
    assert!(dir.path().join("monolithic/final_result.json").exists());

    let layout = OutputLayout::new(dir.path().join("decomposed"));
    let mut driver =
        InstanceDriver::new(&instance, self::config(StructureType::SlimFat), layout, None)
            .unwrap();
    let decomposed = driver.run().unwrap();
    assert_eq!(decomposed.best_final_value, report.best_final_value);
}

#[test]
fn approximation_percentage_stops_the_first_good_iteration() {
    let instance = gap_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut config = config(StructureType::SlimFat);
    // Iteration 1 reaches final 8 against master 12: ratio 2/3 ≥ 0.6.
    config.early_stop_optimum_approximation_percentage = 0.6;

    let mut driver = InstanceDriver::new(&instance, config, layout, None).unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.stop, StopReason::ApproximationReached);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.best_final_value, Some(8.0));
}

#[test]
fn best_final_value_is_monotone_across_iterations() {
    let instance = gap_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let mut driver =
        InstanceDriver::new(&instance, config(StructureType::SlimFat), layout, None).unwrap();

    let mut previous_best = None;
    loop {
        let outcome = driver.step().unwrap();
        let best = driver.best_final_value();
        if let (Some(previous), Some(best)) = (previous_best, best) {
            assert!(best >= previous, "best value regressed: {previous} -> {best}");
        }
        previous_best = best;
        if matches!(outcome, StepOutcome::Stopped(_)) {
            break;
        }
    }
}
