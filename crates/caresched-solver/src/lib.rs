//! # caresched-solver
//!
//! Logic-based Benders decomposition engine for multi-day care-unit
//! scheduling.
//!
//! A run of the engine iterates:
//!
//! 1. **Master** relaxation ([`master`]) — pick which (patient, service,
//!    day[, operator]) assignments to attempt; an optimistic upper bound.
//! 2. **Cache matching** ([`cache`]) — from iteration three, recombine the
//!    best cached per-day packings into a candidate result, stopping early
//!    when it reaches the master bound.
//! 3. **Day subproblems** ([`subproblem`]) — pack each day's assignments
//!    into operator shifts, or reuse a cached day verbatim.
//! 4. **Cores** ([`cores`], [`expansion`], [`subsumption`]) — turn each
//!    unpackable day into no-good cuts, shrink them, replicate them across
//!    renamings and subsuming days, and feed them back into the master.
//!
//! The loop lives in [`driver::InstanceDriver`]; every MILP goes through
//! the narrow oracle port in [`milp`]. The [`monolithic`] module holds the
//! single-shot reference model used for validation and benchmarks.

pub mod cache;
pub mod config;
pub mod cores;
pub mod driver;
pub mod expansion;
pub mod master;
pub mod milp;
pub mod monolithic;
pub mod persist;
pub mod subproblem;
pub mod subsumption;

pub use config::{ConfigFile, CoreType, PhaseConfig, SolverConfig, StructureType};
pub use driver::{
    solve_monolithic, DriverError, InstanceDriver, RunReport, StepOutcome, StopReason,
};
pub use milp::{SolveLimits, SolveStatus};
pub use persist::OutputLayout;
