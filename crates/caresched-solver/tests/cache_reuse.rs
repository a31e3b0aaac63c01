//! Cache behavior across iterations: recording, matching and the
//! optimum-from-cache stop.
//!
//! Four duration-4 requests against two 6-slot operators keep the master
//! bound at 12 until every 3-subset has been cut away (one basic core per
//! iteration, four subsets), so the bound falls to the true optimum of 8
//! exactly at iteration five — where the cache matching, already holding
//! optimal day pieces from earlier iterations, wins before any subproblem
//! is solved.

use caresched_core::{Day, MasterInstance, MasterPatient, Operator, Service, Window};
use caresched_solver::{
    InstanceDriver, OutputLayout, SolverConfig, StopReason, StructureType,
};
use pretty_assertions::assert_eq;

fn four_patient_instance() -> MasterInstance {
    let mut instance = MasterInstance::default();
    instance
        .services
        .insert("srv00".into(), Service { care_unit: "cu00".into(), duration: 4 });
    let mut day = Day::default();
    day.add_operator("cu00", "op00", Operator { start: 0, duration: 6 });
    day.add_operator("cu00", "op01", Operator { start: 0, duration: 6 });
    instance.days.insert(1, day);
    for index in 0..4 {
        let mut patient = MasterPatient::new(1);
        patient.add_request("srv00", Window::new(1, 1));
        instance.patients.insert(format!("pat{index:02}"), patient);
    }
    instance
}

#[test]
fn cache_matching_reaches_the_master_bound() {
    let instance = four_patient_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let config = SolverConfig {
        structure_type: StructureType::SlimFat,
        use_cache: true,
        max_iteration: 10,
        ..SolverConfig::default()
    };

    let mut driver = InstanceDriver::new(&instance, config, layout, None).unwrap();
    let report = driver.run().unwrap();

    // Iterations 1-4 each ban one 3-subset; iteration 5's master bound is
    // the true optimum and the cache already realises it.
    assert_eq!(report.stop, StopReason::OptimumFromCache);
    assert_eq!(report.iterations, 5);
    assert_eq!(report.best_final_value, Some(8.0));

    // The cache candidate can never lag behind the best packing found.
    assert!(driver.best_cache_value() >= driver.best_subproblem_value());

    let run = dir.path().join("run");
    assert!(run.join("iter_5/cache_matching.json").exists());
    assert!(run.join("iter_5/cache_final_result.json").exists());
    // The winning iteration stopped before solving any day subproblem.
    assert!(!run.join("iter_5/subproblem_day_1_result.json").exists());
}

#[test]
fn cache_entries_stay_sound_against_persisted_results() {
    let instance = four_patient_instance();
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("run"));

    let config = SolverConfig {
        structure_type: StructureType::SlimFat,
        use_cache: true,
        max_iteration: 3,
        ..SolverConfig::default()
    };

    let mut driver = InstanceDriver::new(&instance, config, layout, None).unwrap();
    let _ = driver.run().unwrap();

    // Every (iteration, day) recorded for an obligation must point to a
    // persisted subproblem result that schedules that obligation.
    for (request, entries) in driver.cache() {
        for entry in entries {
            let path = dir
                .path()
                .join("run")
                .join(format!("iter_{}", entry.iteration))
                .join(format!("subproblem_day_{}_result.json", entry.day));
            let result: caresched_core::SubproblemResult =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            assert!(
                result
                    .scheduled()
                    .iter()
                    .any(|p| p.patient == request.patient && p.service == request.service),
                "cache entry {entry:?} not backed by {}",
                path.display()
            );
            assert!(request.window.contains(entry.day));
        }
    }
}
