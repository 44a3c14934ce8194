use std::time::Duration;

pub mod al;
pub mod ilqr;

/// Outcome of a solve.
///
/// Only configuration faults are reported as `Err` values at setup time.
/// Everything that happens during a solve comes back as one of these, with
/// the best trajectory seen so far always available from the solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
    /// `solve` has not been called yet.
    Unsolved,
    /// All termination tolerances were met.
    Converged,
    /// An iteration cap (or the wall-clock budget) was exhausted first.
    MaxIterations,
    /// `Q_uu` stayed indefinite with the regularization saturated.
    BackwardPassRegFailure,
    /// No line-search step was accepted with the regularization saturated.
    LineSearchFailure,
    /// Every line-search candidate increased the cost.
    CostIncrease,
    /// A rollout or cost evaluation produced a non-finite value.
    StateNotFinite,
    /// The observer requested a cooperative abort.
    UserAborted,
}

impl SolveStatus {
    /// True for the failure modes the augmented Lagrangian outer loop
    /// cannot recover from by adjusting multipliers.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            SolveStatus::BackwardPassRegFailure
                | SolveStatus::LineSearchFailure
                | SolveStatus::CostIncrease
                | SolveStatus::StateNotFinite
                | SolveStatus::UserAborted
        )
    }
}

/// Summary of the last solve.
#[derive(Clone, Debug)]
pub struct SolveStats {
    pub status: SolveStatus,
    /// Inner iterations spent, cumulative across outer iterations.
    pub iterations: usize,
    /// Augmented Lagrangian outer iterations (zero for a plain inner solve).
    pub outer_iterations: usize,
    pub cost: f64,
    /// Cost decrease of the last accepted step.
    pub cost_decrease: f64,
    /// Scaled feedforward norm `max_k |d_k|_inf / (1 + |u_k|_inf)`.
    pub gradient: f64,
    /// Maximum constraint violation; zero when no constraints are present.
    pub violation: f64,
    pub solve_time: Duration,
}

impl Default for SolveStats {
    fn default() -> Self {
        Self {
            status: SolveStatus::Unsolved,
            iterations: 0,
            outer_iterations: 0,
            cost: f64::INFINITY,
            cost_decrease: f64::INFINITY,
            gradient: f64::INFINITY,
            violation: 0.0,
            solve_time: Duration::ZERO,
        }
    }
}
