//! Iteration driver: the Benders loop over master, cache and day
//! subproblems.
//!
//! One [`InstanceDriver`] owns everything derived from an instance — the
//! incrementally-constrained master model, the cache, best-so-far values
//! and the cumulative solver-time account. [`InstanceDriver::step`] runs
//! one full iteration and reports a [`StepOutcome`]; the loop is otherwise
//! plain synchronous control flow, with every artifact persisted between
//! oracle calls.

use crate::cache::{
    exhume_final_result, fix_cache_final_result, previous_cache_day_iterations,
    record_final_result, Cache, CacheMatchingModel,
};
use crate::config::{CoreType, SolverConfig, StructureType};
use crate::cores::{
    basic_cores, fat_link, generalist_cores, preemptive_cores, pruned_fat_cores,
    pruned_slim_cores, realign_to_master, reduce_cores, slim_link, Cores, DayComponents,
    PruneOptions,
};
use crate::expansion::{expand_cores, AllPossibleRequests};
use crate::master::MasterModel;
use crate::milp::SolveOutcome;
use crate::monolithic::{MonolithicModel, MonolithicOptions};
use crate::persist::{
    read_json, write_json, write_solve_log, write_yaml, OutputLayout, PersistError,
};
use crate::subproblem::{FatSubproblemModel, SlimSubproblemModel};
use crate::subsumption::{compute_subsumptions, Subsumptions};
use caresched_core::{check, value};
use caresched_core::{
    DayName, FatRequest, FatSubproblemInstance, FatSubproblemPatient, FinalResult, IterationName,
    MasterInstance, MasterResult, ServiceOperator, SlimSubproblemInstance, SlimSubproblemPatient,
    SubproblemInstance, SubproblemResult,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Outcomes and errors
// ============================================================================

/// Why a run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The cache matching reached the master bound
    OptimumFromCache,
    /// The composed final result reached the master bound
    OptimumFromFinal,
    /// Every day subproblem satisfied all its requests
    FullySatisfied,
    /// Cumulative solver time passed `total_time_limit`
    TimeLimit,
    /// `max_iteration` iterations completed
    MaxIterations,
    /// `final ≥ pct · master` with the early-stop percentage configured
    ApproximationReached,
}

/// Result of advancing the driver by one iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stopped(StopReason),
}

/// Which artifact a structural check rejected; carries the exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactPhase {
    MasterInstance,
    MasterResult,
    CacheResult,
    SubproblemInstance,
    SubproblemResult,
    FinalResult,
    GeneralistCores,
    BasicFatCores,
    ReducedFatCores,
    PrunedFatCores,
    BasicSlimCores,
    ReducedSlimCores,
    PrunedSlimCores,
    ExpandedCores,
}

impl ArtifactPhase {
    pub fn exit_code(self) -> i32 {
        match self {
            ArtifactPhase::MasterInstance => 1,
            ArtifactPhase::MasterResult => 2,
            ArtifactPhase::CacheResult => 3,
            ArtifactPhase::SubproblemInstance => 4,
            ArtifactPhase::SubproblemResult => 5,
            ArtifactPhase::FinalResult => 6,
            ArtifactPhase::GeneralistCores => 7,
            ArtifactPhase::BasicFatCores => 8,
            ArtifactPhase::ReducedFatCores => 9,
            ArtifactPhase::PrunedFatCores => 10,
            ArtifactPhase::BasicSlimCores => 11,
            ArtifactPhase::ReducedSlimCores => 12,
            ArtifactPhase::PrunedSlimCores => 13,
            ArtifactPhase::ExpandedCores => 14,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ArtifactPhase::MasterInstance => "master instance",
            ArtifactPhase::MasterResult => "master result",
            ArtifactPhase::CacheResult => "cache final result",
            ArtifactPhase::SubproblemInstance => "subproblem instance",
            ArtifactPhase::SubproblemResult => "subproblem result",
            ArtifactPhase::FinalResult => "final result",
            ArtifactPhase::GeneralistCores => "generalist cores",
            ArtifactPhase::BasicFatCores | ArtifactPhase::BasicSlimCores => "basic cores",
            ArtifactPhase::ReducedFatCores | ArtifactPhase::ReducedSlimCores => "reduced cores",
            ArtifactPhase::PrunedFatCores | ArtifactPhase::PrunedSlimCores => "pruned cores",
            ArtifactPhase::ExpandedCores => "expanded cores",
        }
    }
}

/// A structural failure or a persistence failure; both abort the instance.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{} failed validation: {}", phase.label(), errors.join("; "))]
    Validation { phase: ArtifactPhase, errors: Vec<String> },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl DriverError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DriverError::Validation { phase, .. } => phase.exit_code(),
            DriverError::Persist(_) => 1,
        }
    }
}

fn ensure(phase: ArtifactPhase, errors: Vec<String>) -> Result<(), DriverError> {
    if errors.is_empty() {
        Ok(())
    } else {
        for error in &errors {
            warn!(phase = phase.label(), %error, "validation error");
        }
        Err(DriverError::Validation { phase, errors })
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub stop: StopReason,
    pub iterations: IterationName,
    pub best_final_value: Option<f64>,
    pub solver_time: Duration,
}

// ============================================================================
// Driver
// ============================================================================

pub struct InstanceDriver<'a> {
    instance: &'a MasterInstance,
    config: SolverConfig,
    layout: OutputLayout,
    master_model: MasterModel,
    all_possible: AllPossibleRequests,
    subsumptions: Option<Subsumptions>,
    cache: Cache,
    iteration: IterationName,
    minimize_accesses: bool,
    worst_case_days: usize,
    best_final_value: Option<f64>,
    best_subproblem_value: Option<f64>,
    best_cache_value: Option<f64>,
    solver_time: Duration,
}

impl<'a> InstanceDriver<'a> {
    /// Validate the instance, persist it with its configuration, build the
    /// master model and the expansion data.
    pub fn new(
        instance: &'a MasterInstance,
        config: SolverConfig,
        layout: OutputLayout,
        merged_config: Option<&serde_yaml::Value>,
    ) -> Result<Self, DriverError> {
        layout.prepare_root()?;
        write_json(&layout.master_instance(), instance)?;
        match merged_config {
            Some(value) => write_yaml(&layout.config(), value)?,
            None => {
                let value = serde_yaml::to_value(&config).unwrap_or(serde_yaml::Value::Null);
                write_yaml(&layout.config(), &value)?;
            }
        }

        ensure(ArtifactPhase::MasterInstance, check::check_master_instance(instance))?;

        let minimize_accesses = config.master.has("minimize_hospital_accesses");
        let build_start = Instant::now();
        let master_model =
            MasterModel::build(instance, config.structure_type, minimize_accesses);
        let (variables, constraints) = master_model.size();
        info!(
            variables,
            constraints,
            elapsed_ms = build_start.elapsed().as_millis(),
            "master model created"
        );

        let subsumptions = if config.core_day_expansion {
            info!("computing day subsumptions");
            Some(compute_subsumptions(instance, &config.subsumption.limits()))
        } else {
            None
        };
        let all_possible =
            AllPossibleRequests::for_structure(instance, config.structure_type.master_is_fat());
        let worst_case_days = value::worst_case_day_number(instance);

        Ok(Self {
            instance,
            config,
            layout,
            master_model,
            all_possible,
            subsumptions,
            cache: Cache::new(),
            iteration: 0,
            minimize_accesses,
            worst_case_days,
            best_final_value: None,
            best_subproblem_value: None,
            best_cache_value: None,
            solver_time: Duration::ZERO,
        })
    }

    pub fn iteration(&self) -> IterationName {
        self.iteration
    }

    pub fn best_final_value(&self) -> Option<f64> {
        self.best_final_value
    }

    pub fn best_cache_value(&self) -> Option<f64> {
        self.best_cache_value
    }

    pub fn best_subproblem_value(&self) -> Option<f64> {
        self.best_subproblem_value
    }

    pub fn solver_time(&self) -> Duration {
        self.solver_time
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    fn schedule_value(&self, scheduled: &BTreeMap<DayName, Vec<impl caresched_core::RequestRef>>) -> f64 {
        value::result_value(self.instance, scheduled, self.minimize_accesses, self.worst_case_days)
    }

    /// Run iterations until a terminal outcome.
    pub fn run(&mut self) -> Result<RunReport, DriverError> {
        loop {
            if let StepOutcome::Stopped(stop) = self.step()? {
                return Ok(RunReport {
                    stop,
                    iterations: self.iteration,
                    best_final_value: self.best_final_value,
                    solver_time: self.solver_time,
                });
            }
        }
    }

    /// Advance by one full iteration.
    pub fn step(&mut self) -> Result<StepOutcome, DriverError> {
        self.iteration += 1;
        let iteration = self.iteration;
        self.layout.prepare_iteration(iteration)?;

        // ── Master ──────────────────────────────────────────────────────
        let outcome = self.master_model.solve(&self.config.master.limits());
        self.solver_time += outcome.elapsed;
        let (variables, constraints) = self.master_model.size();
        write_solve_log(&self.layout.master_log(iteration), &outcome, variables, constraints)?;

        let master_result = self.master_model.extract(&outcome);
        write_json(&self.layout.master_result(iteration), &master_result)?;
        ensure(
            ArtifactPhase::MasterResult,
            check::check_master_result(self.instance, &master_result),
        )?;

        let master_value = match &master_result {
            MasterResult::Fat(result) => self.schedule_value(&result.scheduled),
            MasterResult::Slim(result) => self.schedule_value(&result.scheduled),
        };
        info!(iteration, master_value, elapsed_ms = outcome.elapsed.as_millis(), "master solved");

        // ── Cache matching ──────────────────────────────────────────────
        if self.config.use_cache && iteration > 2 {
            if let Some(stop) = self.try_cache_matching(iteration, master_value)? {
                return Ok(StepOutcome::Stopped(stop));
            }
        }

        let reusable = if self.config.use_cache && iteration > 1 {
            previous_cache_day_iterations(&self.cache, &master_result, self.instance)
        } else {
            BTreeMap::new()
        };
        if self.config.use_cache && iteration > 1 {
            info!(iteration, reusable_days = reusable.len(), "cache day reuse computed");
        }

        // ── Day subproblems ─────────────────────────────────────────────
        let (results, fat_instances, slim_instances) =
            self.solve_day_subproblems(iteration, &master_result, &reusable)?;

        // ── Final result ────────────────────────────────────────────────
        let final_result = self.compose_final_result(&master_result, &results);
        write_json(&self.layout.final_result(iteration), &final_result)?;
        ensure(
            ArtifactPhase::FinalResult,
            check::check_final_result(self.instance, &final_result),
        )?;

        let final_value = self.schedule_value(&final_result.scheduled);
        info!(iteration, final_value, master_value, "final result composed");

        if self.best_subproblem_value.map_or(true, |best| final_value > best) {
            self.best_subproblem_value = Some(final_value);
        }
        if self.best_final_value.map_or(true, |best| final_value > best) {
            self.best_final_value = Some(final_value);
            write_json(&self.layout.best_final_result(), &final_result)?;
            info!(iteration, final_value, "new best solution");
        }

        let any_rejected = results.values().any(SubproblemResult::has_rejections);
        if !any_rejected {
            info!(iteration, final_value, "all days satisfied");
            return Ok(StepOutcome::Stopped(StopReason::FullySatisfied));
        }
        if final_value >= master_value {
            info!(iteration, final_value, "optimum reached by final result");
            return Ok(StepOutcome::Stopped(StopReason::OptimumFromFinal));
        }

        // ── Preemptive cores and realignment (fat-fat) ──────────────────
        if self.config.preemptive_forbidding() {
            self.inject_preemptive_cores(iteration, &master_result, &results)?;
        }

        // ── Core pipeline ───────────────────────────────────────────────
        let cores =
            self.extract_cores(iteration, &master_result, &results, &fat_instances, &slim_instances)?;

        let cores = if self.config.any_core_expansion() && !cores.is_empty() {
            let expanded = expand_cores(
                &cores,
                &self.all_possible,
                &self.instance.services,
                &self.config,
                self.subsumptions.as_ref(),
            );
            let aggregated = cores.aggregate(&expanded);
            info!(
                iteration,
                extracted = cores.len(),
                expanded = expanded.len(),
                aggregated = aggregated.len(),
                "core expansion finished"
            );
            write_json(&self.layout.cores(iteration, "expanded"), &aggregated)?;
            ensure(ArtifactPhase::ExpandedCores, aggregated.check(self.instance))?;
            aggregated
        } else {
            cores
        };

        self.master_model.add_core_cuts(&cores);
        info!(iteration, cores = cores.len(), "core cuts added to master");

        // ── Cache recording ─────────────────────────────────────────────
        if self.config.use_cache {
            record_final_result(&mut self.cache, self.instance, &final_result, iteration);
        }

        // ── Stop criteria ───────────────────────────────────────────────
        let percentage = self.config.early_stop_optimum_approximation_percentage;
        if percentage < 1.0 && final_value >= master_value * percentage {
            info!(iteration, final_value, master_value, percentage, "approximation reached");
            return Ok(StepOutcome::Stopped(StopReason::ApproximationReached));
        }
        if self.solver_time.as_secs_f64() >= self.config.total_time_limit {
            info!(iteration, elapsed = self.solver_time.as_secs_f64(), "total time limit reached");
            return Ok(StepOutcome::Stopped(StopReason::TimeLimit));
        }
        if iteration >= self.config.max_iteration {
            info!(iteration, "maximum iteration reached");
            return Ok(StepOutcome::Stopped(StopReason::MaxIterations));
        }

        Ok(StepOutcome::Continue)
    }

    // ────────────────────────────────────────────────────────────────────
    // Cache matching
    // ────────────────────────────────────────────────────────────────────

    fn try_cache_matching(
        &mut self,
        iteration: IterationName,
        master_value: f64,
    ) -> Result<Option<StopReason>, DriverError> {
        let model = CacheMatchingModel::build(self.instance, &self.cache);
        let outcome = model.solve(&self.config.cache.limits());
        self.solver_time += outcome.elapsed;
        let (variables, constraints) = model.size();
        write_solve_log(&self.layout.cache_log(iteration), &outcome, variables, constraints)?;

        let matching = model.extract(&outcome);
        write_json(&self.layout.cache_matching(iteration), &matching)?;

        let mut cache_final = exhume_final_result(&matching, &self.layout)?;
        fix_cache_final_result(self.instance, &mut cache_final);
        write_json(&self.layout.cache_final_result(iteration), &cache_final)?;
        ensure(
            ArtifactPhase::CacheResult,
            check::check_final_result(self.instance, &cache_final),
        )?;

        let cache_value = self.schedule_value(&cache_final.scheduled);
        info!(iteration, cache_value, "cache matching solved");

        if self.best_cache_value.map_or(true, |best| cache_value > best) {
            self.best_cache_value = Some(cache_value);
        }
        if self.best_final_value.map_or(true, |best| cache_value > best) {
            self.best_final_value = Some(cache_value);
            write_json(&self.layout.best_final_result(), &cache_final)?;
            info!(iteration, cache_value, "new best solution from cache");
        }

        if cache_value >= master_value {
            info!(iteration, cache_value, "optimum reached by cache matching");
            return Ok(Some(StopReason::OptimumFromCache));
        }
        Ok(None)
    }

    // ────────────────────────────────────────────────────────────────────
    // Day subproblems
    // ────────────────────────────────────────────────────────────────────

    #[allow(clippy::type_complexity)]
    fn solve_day_subproblems(
        &mut self,
        iteration: IterationName,
        master_result: &MasterResult,
        reusable: &BTreeMap<DayName, IterationName>,
    ) -> Result<
        (
            BTreeMap<DayName, SubproblemResult>,
            BTreeMap<DayName, FatSubproblemInstance>,
            BTreeMap<DayName, SlimSubproblemInstance>,
        ),
        DriverError,
    > {
        let mut results = BTreeMap::new();
        let mut fat_instances = BTreeMap::new();
        let mut slim_instances = BTreeMap::new();

        for day in master_result.day_names() {
            let sub_instance = self.build_day_instance(master_result, day);
            write_json(&self.layout.subproblem_instance(iteration, day), &sub_instance)?;
            ensure(
                ArtifactPhase::SubproblemInstance,
                check::check_subproblem_instance(&sub_instance),
            )?;

            let result = if let Some(&source_iteration) = reusable.get(&day) {
                info!(iteration, day, source_iteration, "reusing cached day result");
                let mut result: SubproblemResult =
                    read_json(&self.layout.subproblem_result(source_iteration, day))?;
                result.retain_requests(&master_result.slim_requests_on(day));
                result
            } else {
                self.solve_one_day(iteration, master_result, &sub_instance, day)?
            };

            write_json(&self.layout.subproblem_result(iteration, day), &result)?;
            ensure(
                ArtifactPhase::SubproblemResult,
                check::check_subproblem_result(&sub_instance, &result),
            )?;

            match sub_instance {
                SubproblemInstance::Fat(instance) => {
                    fat_instances.insert(day, instance);
                }
                SubproblemInstance::Slim(instance) => {
                    slim_instances.insert(day, instance);
                }
            }
            results.insert(day, result);
        }

        Ok((results, fat_instances, slim_instances))
    }

    fn build_day_instance(&self, master_result: &MasterResult, day: DayName) -> SubproblemInstance {
        match master_result {
            MasterResult::Fat(result) => {
                let mut instance = FatSubproblemInstance {
                    services: self.instance.services.clone(),
                    day: self.instance.days[&day].clone(),
                    patients: BTreeMap::new(),
                };
                for request in result.scheduled.get(&day).into_iter().flatten() {
                    let priority = self.instance.patients[&request.patient].priority;
                    instance
                        .patients
                        .entry(request.patient.clone())
                        .or_insert_with(|| FatSubproblemPatient { priority, requests: Vec::new() })
                        .requests
                        .push(ServiceOperator {
                            service: request.service.clone(),
                            operator: request.operator.clone(),
                        });
                }
                SubproblemInstance::Fat(instance)
            }
            MasterResult::Slim(result) => {
                let mut instance = SlimSubproblemInstance {
                    services: self.instance.services.clone(),
                    day: self.instance.days[&day].clone(),
                    patients: BTreeMap::new(),
                };
                for request in result.scheduled.get(&day).into_iter().flatten() {
                    let priority = self.instance.patients[&request.patient].priority;
                    instance
                        .patients
                        .entry(request.patient.clone())
                        .or_insert_with(|| SlimSubproblemPatient {
                            priority,
                            requests: Vec::new(),
                        })
                        .requests
                        .push(request.service.clone());
                }
                SubproblemInstance::Slim(instance)
            }
        }
    }

    fn solve_one_day(
        &mut self,
        iteration: IterationName,
        master_result: &MasterResult,
        sub_instance: &SubproblemInstance,
        day: DayName,
    ) -> Result<SubproblemResult, DriverError> {
        let redundant_cut = self.config.subproblem.has("use_redundant_operator_cut");
        let limits = self.config.subproblem.limits();

        let (result, outcome, size) = match (sub_instance, self.config.structure_type) {
            // Fat master keeping its operators: fixed-operator packing.
            (SubproblemInstance::Fat(instance), StructureType::FatSlim) => {
                let model = FatSubproblemModel::build(instance);
                let outcome = model.solve(&limits);
                let result = model.extract(&outcome);
                (SubproblemResult::Fat(result), outcome, model.size())
            }
            // Forgetful fat: project away the operators, optionally with
            // the exact-match bonus.
            (SubproblemInstance::Fat(instance), _) => {
                let forgetful = instance.forgetful();
                let master_requests: Option<Vec<FatRequest>> =
                    if self.config.preemptive_forbidding() {
                        match master_result {
                            MasterResult::Fat(result) => result.scheduled.get(&day).cloned(),
                            MasterResult::Slim(_) => None,
                        }
                    } else {
                        None
                    };
                let model = SlimSubproblemModel::build(
                    &forgetful,
                    redundant_cut,
                    master_requests.as_deref(),
                );
                let outcome = model.solve(&limits);
                let result = model.extract(&outcome);
                (SubproblemResult::Slim(result), outcome, model.size())
            }
            (SubproblemInstance::Slim(instance), _) => {
                let model = SlimSubproblemModel::build(instance, redundant_cut, None);
                let outcome = model.solve(&limits);
                let result = model.extract(&outcome);
                (SubproblemResult::Slim(result), outcome, model.size())
            }
        };

        self.solver_time += outcome.elapsed;
        write_solve_log(
            &self.layout.subproblem_log(iteration, day),
            &outcome,
            size.0,
            size.1,
        )?;
        info!(
            iteration,
            day,
            rejected = result.rejected_count(),
            elapsed_ms = outcome.elapsed.as_millis(),
            "day subproblem solved"
        );
        Ok(result)
    }

    // ────────────────────────────────────────────────────────────────────
    // Final result composition
    // ────────────────────────────────────────────────────────────────────

    fn compose_final_result(
        &self,
        master_result: &MasterResult,
        results: &BTreeMap<DayName, SubproblemResult>,
    ) -> FinalResult {
        let mut final_result = FinalResult {
            scheduled: results
                .iter()
                .map(|(day, result)| (*day, result.scheduled().to_vec()))
                .collect(),
            rejected: master_result.rejected().to_vec(),
        };

        // Any obligation no day's packing covers joins the rejections.
        for request in self.instance.window_requests() {
            if final_result.rejected.contains(&request) {
                continue;
            }
            let satisfied = request.window.days().any(|day| {
                results.get(&day).is_some_and(|result| {
                    result
                        .scheduled()
                        .iter()
                        .any(|p| p.patient == request.patient && p.service == request.service)
                })
            });
            if !satisfied {
                final_result.rejected.push(request);
            }
        }

        final_result
    }

    // ────────────────────────────────────────────────────────────────────
    // Cores
    // ────────────────────────────────────────────────────────────────────

    fn inject_preemptive_cores(
        &mut self,
        iteration: IterationName,
        master_result: &MasterResult,
        results: &BTreeMap<DayName, SubproblemResult>,
    ) -> Result<(), DriverError> {
        let MasterResult::Fat(master_fat) = master_result else {
            return Ok(());
        };
        let slim_results: BTreeMap<DayName, _> = results
            .iter()
            .filter_map(|(day, result)| match result {
                SubproblemResult::Slim(result) => Some((*day, result.clone())),
                SubproblemResult::Fat(_) => None,
            })
            .collect();
        let cores = preemptive_cores(master_fat, &slim_results);
        if cores.is_empty() {
            info!(iteration, "no preemptive core found");
            return Ok(());
        }
        write_json(&self.layout.cores(iteration, "preemptive"), &cores)?;
        info!(iteration, cores = cores.len(), "preemptive cores added");
        self.master_model.add_core_cuts(&Cores::Fat(cores));
        Ok(())
    }

    /// Run the configured stages of the extraction pipeline, persisting
    /// and checking every stage's output.
    fn extract_cores(
        &mut self,
        iteration: IterationName,
        master_result: &MasterResult,
        results: &BTreeMap<DayName, SubproblemResult>,
        fat_instances: &BTreeMap<DayName, FatSubproblemInstance>,
        slim_instances: &BTreeMap<DayName, SlimSubproblemInstance>,
    ) -> Result<Cores, DriverError> {
        let core_type = self.config.core_type;
        let stage_start = Instant::now();

        if master_result.is_fat() {
            // Realign the in-memory copy to the master's operators; the
            // persisted results keep the solver's choices.
            let day_results: BTreeMap<DayName, _> = results
                .iter()
                .map(|(day, result)| {
                    let realigned = match result {
                        SubproblemResult::Fat(result) => result.clone(),
                        SubproblemResult::Slim(result) => {
                            let MasterResult::Fat(master_fat) = master_result else {
                                unreachable!("fat master checked above");
                            };
                            realign_to_master(
                                result,
                                master_fat.scheduled.get(day).map_or(&[], Vec::as_slice),
                            )
                        }
                    };
                    (*day, realigned)
                })
                .collect();
            let components: Vec<DayComponents<FatRequest>> = day_results
                .iter()
                .map(|(day, result)| DayComponents::from_fat(*day, result))
                .collect();

            if core_type == CoreType::Generalist {
                let cores = generalist_cores(&components);
                self.solver_time += stage_start.elapsed();
                return self.persist_core_stage(
                    iteration,
                    Cores::Fat(cores),
                    "generalist",
                    ArtifactPhase::GeneralistCores,
                );
            }

            let cores = basic_cores(&components);
            self.solver_time += stage_start.elapsed();
            let mut cores = match self.persist_core_stage(
                iteration,
                Cores::Fat(cores),
                "basic",
                ArtifactPhase::BasicFatCores,
            )? {
                Cores::Fat(cores) => cores,
                Cores::Slim(_) => unreachable!(),
            };

            if core_type >= CoreType::Reduced {
                let stage_start = Instant::now();
                cores = reduce_cores(cores, fat_link);
                self.solver_time += stage_start.elapsed();
                cores = match self.persist_core_stage(
                    iteration,
                    Cores::Fat(cores),
                    "reduced",
                    ArtifactPhase::ReducedFatCores,
                )? {
                    Cores::Fat(cores) => cores,
                    Cores::Slim(_) => unreachable!(),
                };
            }

            if core_type == CoreType::Pruned {
                let stage_start = Instant::now();
                cores = pruned_fat_cores(fat_instances, cores, &self.prune_options());
                self.solver_time += stage_start.elapsed();
                cores = match self.persist_core_stage(
                    iteration,
                    Cores::Fat(cores),
                    "pruned",
                    ArtifactPhase::PrunedFatCores,
                )? {
                    Cores::Fat(cores) => cores,
                    Cores::Slim(_) => unreachable!(),
                };
            }

            Ok(Cores::Fat(cores))
        } else {
            let slim_results: BTreeMap<DayName, _> = results
                .iter()
                .filter_map(|(day, result)| match result {
                    SubproblemResult::Slim(result) => Some((*day, result.clone())),
                    SubproblemResult::Fat(_) => None,
                })
                .collect();
            let components: Vec<DayComponents<caresched_core::SlimRequest>> = slim_results
                .iter()
                .map(|(day, result)| DayComponents::from_slim(*day, result))
                .collect();

            if core_type == CoreType::Generalist {
                let cores = generalist_cores(&components);
                self.solver_time += stage_start.elapsed();
                return self.persist_core_stage(
                    iteration,
                    Cores::Slim(cores),
                    "generalist",
                    ArtifactPhase::GeneralistCores,
                );
            }

            let cores = basic_cores(&components);
            self.solver_time += stage_start.elapsed();
            let mut cores = match self.persist_core_stage(
                iteration,
                Cores::Slim(cores),
                "basic",
                ArtifactPhase::BasicSlimCores,
            )? {
                Cores::Slim(cores) => cores,
                Cores::Fat(_) => unreachable!(),
            };

            if core_type >= CoreType::Reduced {
                let stage_start = Instant::now();
                cores = reduce_cores(cores, slim_link(&self.instance.services));
                self.solver_time += stage_start.elapsed();
                cores = match self.persist_core_stage(
                    iteration,
                    Cores::Slim(cores),
                    "reduced",
                    ArtifactPhase::ReducedSlimCores,
                )? {
                    Cores::Slim(cores) => cores,
                    Cores::Fat(_) => unreachable!(),
                };
            }

            if core_type == CoreType::Pruned {
                let stage_start = Instant::now();
                cores = pruned_slim_cores(
                    slim_instances,
                    &slim_results,
                    cores,
                    &self.prune_options(),
                );
                self.solver_time += stage_start.elapsed();
                cores = match self.persist_core_stage(
                    iteration,
                    Cores::Slim(cores),
                    "pruned",
                    ArtifactPhase::PrunedSlimCores,
                )? {
                    Cores::Slim(cores) => cores,
                    Cores::Fat(_) => unreachable!(),
                };
            }

            Ok(Cores::Slim(cores))
        }
    }

    fn prune_options(&self) -> PruneOptions {
        PruneOptions {
            post_pruning_irreducibility: self.config.post_pruning_irreducibility,
            use_redundant_operator_cut: self.config.core_pruning.has("use_redundant_operator_cut"),
            limits: self.config.core_pruning.limits(),
        }
    }

    fn persist_core_stage(
        &self,
        iteration: IterationName,
        cores: Cores,
        stage: &str,
        phase: ArtifactPhase,
    ) -> Result<Cores, DriverError> {
        info!(iteration, stage, cores = cores.len(), "core stage finished");
        write_json(&self.layout.cores(iteration, stage), &cores)?;
        ensure(phase, cores.check(self.instance))?;
        Ok(cores)
    }
}

// ============================================================================
// Monolithic runs
// ============================================================================

/// Solve an instance with the single-shot reference model, persisting the
/// final result in the same layout.
pub fn solve_monolithic(
    instance: &MasterInstance,
    config: &SolverConfig,
    layout: &OutputLayout,
    merged_config: Option<&serde_yaml::Value>,
) -> Result<RunReport, DriverError> {
    layout.prepare_root()?;
    write_json(&layout.master_instance(), instance)?;
    match merged_config {
        Some(value) => write_yaml(&layout.config(), value)?,
        None => {
            let value = serde_yaml::to_value(config).unwrap_or(serde_yaml::Value::Null);
            write_yaml(&layout.config(), &value)?;
        }
    }
    ensure(ArtifactPhase::MasterInstance, check::check_master_instance(instance))?;

    let options = MonolithicOptions {
        minimize_hospital_accesses: config.master.has("minimize_hospital_accesses"),
        use_redundant_operator_cut: config.master.has("use_redundant_operator_cut"),
        use_redundant_patient_cut: config.master.has("use_redundant_patient_cut"),
    };
    let model = MonolithicModel::build(instance, &options);
    let outcome: SolveOutcome = model.solve(&config.master.limits());
    let (variables, constraints) = model.size();
    write_solve_log(&layout.root().join("monolithic_log.log"), &outcome, variables, constraints)?;

    let result = model.extract(&outcome);
    ensure(ArtifactPhase::FinalResult, check::check_final_result(instance, &result))?;
    write_json(&layout.root().join("final_result.json"), &result)?;
    write_json(&layout.best_final_result(), &result)?;

    let final_value = value::result_value(
        instance,
        &result.scheduled,
        options.minimize_hospital_accesses,
        value::worst_case_day_number(instance),
    );
    info!(final_value, elapsed_ms = outcome.elapsed.as_millis(), "monolithic model solved");

    let stop = if outcome.status == crate::milp::SolveStatus::Optimal {
        StopReason::OptimumFromFinal
    } else {
        StopReason::TimeLimit
    };
    Ok(RunReport {
        stop,
        iterations: 1,
        best_final_value: Some(final_value),
        solver_time: outcome.elapsed,
    })
}
