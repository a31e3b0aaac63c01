//! Narrow port over the MILP oracle.
//!
//! Every model in this engine (master, day packing, cache matching,
//! expansion matching, subsumption, monolithic) is a pure integer linear
//! program, so the Pumpkin constraint-programming solver is an exact
//! oracle for it. The port keeps the model symbolic — variables, linear
//! constraints, a maximize objective — and translates it to a fresh
//! `pumpkin_solver::Solver` on every [`Model::solve`] call. That makes
//! post-build constraint appends (core cuts, matching bans) trivial for the
//! caller: the model object is never recreated, only re-translated.
//!
//! Returning at the time limit is not an error: the incumbent found so far
//! comes back as [`SolveStatus::Feasible`] and is consumed as-is.

use pumpkin_solver::constraints;
use pumpkin_solver::optimisation::linear_sat_unsat::LinearSatUnsat;
use pumpkin_solver::optimisation::OptimisationDirection;
use pumpkin_solver::results::{OptimisationResult, ProblemSolution};
use pumpkin_solver::termination::TimeBudget;
use pumpkin_solver::variables::TransformableVariable;
use pumpkin_solver::Solver;
use std::time::{Duration, Instant};

/// Handle to a variable of a [`Model`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VarId(usize);

/// `Σ coeff·var + constant` with integer coefficients.
#[derive(Clone, Debug, Default)]
pub struct LinearExpr {
    terms: Vec<(VarId, i64)>,
    constant: i64,
}

impl LinearExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, var: VarId, coeff: i64) -> Self {
        if coeff != 0 {
            self.terms.push((var, coeff));
        }
        self
    }

    pub fn var(var: VarId) -> Self {
        Self::new().term(var, 1)
    }

    pub fn constant(mut self, constant: i64) -> Self {
        self.constant += constant;
        self
    }

    pub fn add_term(&mut self, var: VarId, coeff: i64) {
        if coeff != 0 {
            self.terms.push((var, coeff));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }
}

/// Relation of a linear constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    Le,
    Ge,
    Eq,
}

#[derive(Clone, Debug)]
struct VarBounds {
    lower: i32,
    upper: i32,
}

#[derive(Clone, Debug)]
struct LinearConstraint {
    expr: LinearExpr,
    relation: Relation,
    rhs: i64,
}

/// Per-call resource limits.
///
/// `memory_limit_mb` is carried for configuration compatibility with
/// memory-budgeted backends; the current oracle only enforces the time
/// budget.
#[derive(Clone, Copy, Debug)]
pub struct SolveLimits {
    pub time_limit: Duration,
    pub memory_limit_mb: Option<u64>,
}

impl SolveLimits {
    pub fn seconds(seconds: f64) -> Self {
        Self { time_limit: Duration::from_secs_f64(seconds), memory_limit_mb: None }
    }
}

impl Default for SolveLimits {
    fn default() -> Self {
        Self::seconds(60.0)
    }
}

/// Oracle verdict for one `solve` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
    /// Optimality proven within the budget
    Optimal,
    /// Incumbent found, optimality not proven (time limit)
    Feasible,
    /// No assignment satisfies the constraints
    Infeasible,
    /// Budget exhausted before any incumbent
    Unknown,
}

/// Incumbent (if any) plus accounting for one `solve` call.
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    pub objective: Option<i64>,
    values: Vec<i32>,
    pub elapsed: Duration,
}

impl SolveOutcome {
    /// Whether an incumbent is available to read values from.
    pub fn has_solution(&self) -> bool {
        matches!(self.status, SolveStatus::Optimal | SolveStatus::Feasible)
    }

    /// Value of a variable in the incumbent (0 when none).
    pub fn value(&self, var: VarId) -> i32 {
        self.values.get(var.0).copied().unwrap_or(0)
    }

    /// Whether a binary variable is set in the incumbent.
    pub fn is_set(&self, var: VarId) -> bool {
        self.value(var) >= 1
    }
}

/// A symbolic integer linear model with a maximize objective.
#[derive(Clone, Debug, Default)]
pub struct Model {
    vars: Vec<VarBounds>,
    constraints: Vec<LinearConstraint>,
    objective: LinearExpr,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(&mut self) -> VarId {
        self.integer(0, 1)
    }

    pub fn integer(&mut self, lower: i32, upper: i32) -> VarId {
        let id = VarId(self.vars.len());
        self.vars.push(VarBounds { lower, upper: upper.max(lower) });
        id
    }

    /// Append a linear constraint; valid both before and after solves.
    pub fn constrain(&mut self, expr: LinearExpr, relation: Relation, rhs: i64) {
        self.constraints.push(LinearConstraint { expr, relation, rhs });
    }

    pub fn maximize(&mut self, objective: LinearExpr) {
        self.objective = objective;
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    fn objective_bounds(&self) -> (i64, i64) {
        let mut lower = self.objective.constant;
        let mut upper = self.objective.constant;
        for (var, coeff) in &self.objective.terms {
            let bounds = &self.vars[var.0];
            let a = coeff * i64::from(bounds.lower);
            let b = coeff * i64::from(bounds.upper);
            lower += a.min(b);
            upper += a.max(b);
        }
        (lower, upper)
    }

    /// Translate the model to a fresh Pumpkin solver and optimise it under
    /// the given time budget. Wall-clock elapsed is measured per call.
    pub fn solve(&self, limits: &SolveLimits) -> SolveOutcome {
        let started = Instant::now();

        let mut solver = Solver::default();
        let tag = solver.new_constraint_tag();

        let domains: Vec<_> = self
            .vars
            .iter()
            .map(|bounds| solver.new_bounded_integer(bounds.lower, bounds.upper))
            .collect();

        // A constraint that conflicts at the root makes the whole model
        // unsatisfiable; `post` reports that immediately.
        let mut root_conflict = false;
        for constraint in &self.constraints {
            let rhs = (constraint.rhs - constraint.expr.constant) as i32;
            let scaled: Vec<_> = constraint
                .expr
                .terms
                .iter()
                .map(|(var, coeff)| domains[var.0].scaled(*coeff as i32))
                .collect();
            let posted = match constraint.relation {
                Relation::Le => solver
                    .add_constraint(constraints::less_than_or_equals(scaled, rhs, tag))
                    .post(),
                Relation::Ge => solver
                    .add_constraint(constraints::greater_than_or_equals(scaled, rhs, tag))
                    .post(),
                Relation::Eq => {
                    solver.add_constraint(constraints::equals(scaled, rhs, tag)).post()
                }
            };
            if posted.is_err() {
                root_conflict = true;
            }
        }

        if root_conflict {
            return SolveOutcome {
                status: SolveStatus::Infeasible,
                objective: None,
                values: Vec::new(),
                elapsed: started.elapsed(),
            };
        }

        // Objective variable tied to the objective expression by equality.
        let (objective_lower, objective_upper) = self.objective_bounds();
        let objective_var =
            solver.new_bounded_integer(objective_lower as i32, objective_upper as i32);
        let mut objective_terms: Vec<_> = self
            .objective
            .terms
            .iter()
            .map(|(var, coeff)| domains[var.0].scaled(*coeff as i32))
            .collect();
        objective_terms.push(objective_var.scaled(-1));
        let posted = solver
            .add_constraint(constraints::equals(
                objective_terms,
                -(self.objective.constant as i32),
                tag,
            ))
            .post();
        if posted.is_err() {
            root_conflict = true;
        }

        if root_conflict {
            return SolveOutcome {
                status: SolveStatus::Infeasible,
                objective: None,
                values: Vec::new(),
                elapsed: started.elapsed(),
            };
        }

        let mut brancher = solver.default_brancher();
        let mut termination = TimeBudget::starting_now(limits.time_limit);

        fn noop_callback<B>(
            _: &Solver,
            _: pumpkin_solver::results::SolutionReference,
            _: &B,
        ) {
        }
        let result = solver.optimise(
            &mut brancher,
            &mut termination,
            LinearSatUnsat::new(OptimisationDirection::Maximise, objective_var, noop_callback),
        );

        let (status, solution) = match result {
            OptimisationResult::Optimal(solution) => (SolveStatus::Optimal, Some(solution)),
            OptimisationResult::Satisfiable(solution) => (SolveStatus::Feasible, Some(solution)),
            OptimisationResult::Unsatisfiable => (SolveStatus::Infeasible, None),
            OptimisationResult::Unknown => (SolveStatus::Unknown, None),
        };

        let (objective, values) = match solution {
            Some(solution) => (
                Some(i64::from(solution.get_integer_value(objective_var))),
                domains
                    .iter()
                    .map(|&domain| solution.get_integer_value(domain))
                    .collect(),
            ),
            None => (None, Vec::new()),
        };

        SolveOutcome { status, objective, values, elapsed: started.elapsed() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn maximizes_a_weighted_packing() {
        // max 3x + 2y + 2z  s.t.  x + y ≤ 1, x + z ≤ 1 over binaries
        let mut model = Model::new();
        let x = model.binary();
        let y = model.binary();
        let z = model.binary();
        model.constrain(LinearExpr::new().term(x, 1).term(y, 1), Relation::Le, 1);
        model.constrain(LinearExpr::new().term(x, 1).term(z, 1), Relation::Le, 1);
        model.maximize(LinearExpr::new().term(x, 3).term(y, 2).term(z, 2));

        let outcome = model.solve(&SolveLimits::seconds(5.0));
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert_eq!(outcome.objective, Some(4));
        assert!(!outcome.is_set(x));
        assert!(outcome.is_set(y));
        assert!(outcome.is_set(z));
    }

    #[test]
    fn equality_and_bounds_are_respected() {
        // max t  s.t.  t == 2a + 3, a ∈ [0, 4], t ≤ 9
        let mut model = Model::new();
        let a = model.integer(0, 4);
        let t = model.integer(0, 100);
        model.constrain(
            LinearExpr::new().term(a, 2).term(t, -1).constant(3),
            Relation::Eq,
            0,
        );
        model.constrain(LinearExpr::var(t), Relation::Le, 9);
        model.maximize(LinearExpr::var(t));

        let outcome = model.solve(&SolveLimits::seconds(5.0));
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert_eq!(outcome.value(a), 3);
        assert_eq!(outcome.value(t), 9);
    }

    #[test]
    fn infeasible_model_is_reported() {
        let mut model = Model::new();
        let x = model.binary();
        model.constrain(LinearExpr::var(x), Relation::Ge, 2);
        model.maximize(LinearExpr::var(x));

        let outcome = model.solve(&SolveLimits::seconds(5.0));
        assert_eq!(outcome.status, SolveStatus::Infeasible);
        assert!(!outcome.has_solution());
    }

    #[test]
    fn constraints_can_be_appended_between_solves() {
        let mut model = Model::new();
        let x = model.binary();
        let y = model.binary();
        model.maximize(LinearExpr::new().term(x, 1).term(y, 1));

        let first = model.solve(&SolveLimits::seconds(5.0));
        assert_eq!(first.objective, Some(2));

        // Ban the incumbent, like a core cut does.
        model.constrain(LinearExpr::new().term(x, 1).term(y, 1), Relation::Le, 1);
        let second = model.solve(&SolveLimits::seconds(5.0));
        assert_eq!(second.objective, Some(1));
    }
}
