use std::time::Duration;

/// Where the Levenberg-Marquardt damping `rho` is applied in the backward
/// pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegularizationMode {
    /// Add `rho * I` to `Q_uu` before factorizing.
    Control,
    /// Damp the cost-to-go instead: `Q_uu` and `Q_ux` are formed from
    /// `P + rho * I`.
    State,
    /// Both of the above.
    Both,
}

/// Solver configuration shared by the inner and outer loops.
#[derive(Clone, Debug)]
pub struct SolverOptions {
    /// Maximum number of augmented Lagrangian (outer) iterations.
    pub max_iterations_outer: usize,
    /// Maximum number of inner iterations per solve.
    pub max_iterations_inner: usize,

    /// Termination tolerance on the cost decrease per iteration.
    pub tol_cost: f64,
    /// Termination tolerance on the scaled feedforward norm.
    pub tol_grad: f64,
    /// Termination tolerance on the maximum constraint violation.
    pub tol_viol: f64,
    /// Initial cost tolerance for inner solves; tightened every outer
    /// iteration by `violation_decrease_ratio` until it reaches `tol_cost`.
    pub tol_inner: f64,

    /// Initial backward-pass regularization. Zero means none until a
    /// factorization fails.
    pub rho_init: f64,
    /// Lower bound on the regularization once it is active.
    pub rho_min: f64,
    /// Upper bound on the regularization; saturation is a solver failure.
    pub rho_max: f64,
    /// Multiplicative factor for regularization updates.
    pub rho_scale: f64,

    /// Initial penalty parameter for every constraint.
    pub penalty_init: f64,
    /// Multiplicative penalty growth factor.
    pub penalty_scale: f64,
    /// Upper bound on the penalty parameter.
    pub penalty_max: f64,
    /// Required per-outer-iteration violation decrease; penalties grow only
    /// when the violation fails to shrink by this factor.
    pub violation_decrease_ratio: f64,

    /// Lower bound on the accepted actual-to-expected improvement ratio.
    pub linesearch_decrease_low: f64,
    /// Upper bound on the accepted actual-to-expected improvement ratio.
    pub linesearch_decrease_high: f64,
    /// Smallest step the line search will try before giving up.
    pub linesearch_step_min: f64,
    /// Step contraction factor between line-search candidates.
    pub linesearch_contraction: f64,

    pub regularization_mode: RegularizationMode,

    /// Optional wall-clock budget, checked at iteration boundaries.
    pub max_solve_time: Option<Duration>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations_outer: 30,
            max_iterations_inner: 100,

            tol_cost: 1e-4,
            tol_grad: 1e-2,
            tol_viol: 1e-4,
            tol_inner: 1e-2,

            rho_init: 0.0,
            rho_min: 1e-8,
            rho_max: 1e8,
            rho_scale: 1.6,

            penalty_init: 1.0,
            penalty_scale: 10.0,
            penalty_max: 1e8,
            violation_decrease_ratio: 0.25,

            linesearch_decrease_low: 1e-4,
            linesearch_decrease_high: 10.0,
            linesearch_step_min: 1e-4,
            linesearch_contraction: 0.5,

            regularization_mode: RegularizationMode::Control,

            max_solve_time: None,
        }
    }
}
