//! Constrained trajectory optimization.
//!
//! This crate solves discrete-time, finite-horizon optimal control problems
//!
//! ```txt
//!     minimize   sum_k l_k(x_k, u_k) + l_N(x_N)
//!     subject to x_{k+1} = f(x_k, u_k, h_k)
//!                g_k(x_k, u_k) in K_k
//!                x_0 = x0
//! ```
//!
//! with iterative LQR as the inner solver and an augmented Lagrangian outer
//! loop handling generic conic (equality and inequality) constraints.
//!
//! Costs, dynamics and constraints are user-supplied objects implementing
//! the traits in [`cost`], [`dynamics`] and [`constraint`]; a [`Problem`]
//! registers them per knot together with the initial state, and a solver
//! ([`Ilqr`] or [`AugmentedLagrangian`]) consumes the problem, owns the
//! trajectory being optimized and reports a [`SolveStatus`].

pub mod alg;
pub mod cone;
pub mod constraint;
pub mod cost;
pub mod dynamics;
pub mod function;
pub mod observer;
pub mod options;
pub mod problem;
pub mod trajectory;

#[cfg(test)]
mod tests;

pub use crate::alg::al::AugmentedLagrangian;
pub use crate::alg::ilqr::Ilqr;
pub use crate::alg::{SolveStats, SolveStatus};
pub use crate::cone::Cone;
pub use crate::constraint::{CircleConstraint, Constraint, ControlBound, GoalConstraint};
pub use crate::cost::{CostFunction, QuadraticCost};
pub use crate::dynamics::{
    ContinuousDynamics, DiscreteDynamics, DiscretizedModel, ExplicitEuler, ExplicitIntegrator,
    FrozenStep, RungeKutta4,
};
pub use crate::function::{check_jacobian, VectorFunction};
pub use crate::observer::{IterationRecorder, SolverObserver, SolverStep};
pub use crate::options::{RegularizationMode, SolverOptions};
pub use crate::problem::{Problem, ProblemError};
pub use crate::trajectory::{KnotPoint, Trajectory};
