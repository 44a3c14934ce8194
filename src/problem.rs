use std::rc::Rc;

use nalgebra::DVector;
use thiserror::Error;

use crate::constraint::Constraint;
use crate::cost::CostFunction;
use crate::dynamics::DiscreteDynamics;

/// Configuration faults raised while assembling a problem or a solver.
///
/// These fail fast at setup time; numerical trouble during a solve is
/// reported through [`SolveStatus`](crate::alg::SolveStatus) instead.
#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("knot index {index} out of range for horizon {horizon}")]
    InvalidKnotIndex { index: usize, horizon: usize },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("bounds must have length greater than zero")]
    EmptyBounds,
    #[error("lower bound exceeds upper bound at index {index}")]
    BoundsOutOfOrder { index: usize },
    #[error("constraint `{label}` has no outputs")]
    EmptyConstraint { label: String },
    #[error("matrix {name} must be symmetric")]
    NotSymmetric { name: &'static str },
    #[error("step size must be non-negative, got {step}")]
    NegativeStep { step: f64 },
    #[error("a trajectory needs at least one knot point")]
    EmptyTrajectory,
    #[error("problem is not fully defined")]
    NotFullyDefined,
}

/// A discrete-time optimal control problem over `N` dynamics segments.
///
/// Stores shared handles to the cost at every knot `0..=N`, the dynamics at
/// every segment `0..N`, an unordered collection of constraints per knot,
/// and the initial state. The same cost, model or constraint object may be
/// registered at many knots.
///
/// A problem is assembled once and then consumed (by reference) when
/// constructing a solver; the solver clones the handles it needs and never
/// mutates the problem.
pub struct Problem {
    x0: DVector<f64>,
    costs: Vec<Option<Rc<dyn CostFunction>>>,
    models: Vec<Option<Rc<dyn DiscreteDynamics>>>,
    constraints: Vec<Vec<Rc<dyn Constraint>>>,
}

impl Problem {
    pub fn new(num_segments: usize) -> Self {
        assert!(num_segments > 0, "horizon must have at least one segment");
        Self {
            x0: DVector::zeros(0),
            costs: vec![None; num_segments + 1],
            models: vec![None; num_segments],
            constraints: vec![Vec::new(); num_segments + 1],
        }
    }

    /// Number of dynamics segments `N`.
    pub fn num_segments(&self) -> usize {
        self.models.len()
    }

    /// Register the dynamics for segment `k`. The terminal knot has no
    /// dynamics, so `k = N` is rejected.
    pub fn set_dynamics(
        &mut self,
        model: Rc<dyn DiscreteDynamics>,
        k: usize,
    ) -> Result<(), ProblemError> {
        if k >= self.num_segments() {
            return Err(ProblemError::InvalidKnotIndex {
                index: k,
                horizon: self.num_segments(),
            });
        }
        self.models[k] = Some(model);
        Ok(())
    }

    /// Register dynamics for all segments `0..N` at once.
    pub fn set_dynamics_all(&mut self, models: Vec<Rc<dyn DiscreteDynamics>>) -> Result<(), ProblemError> {
        if models.len() != self.num_segments() {
            return Err(ProblemError::DimensionMismatch {
                expected: self.num_segments(),
                got: models.len(),
            });
        }
        for (k, model) in models.into_iter().enumerate() {
            self.models[k] = Some(model);
        }
        Ok(())
    }

    /// Register the cost for knot `k in [0, N]`. The cost at `k = N` must
    /// report itself terminal.
    pub fn set_cost(&mut self, cost: Rc<dyn CostFunction>, k: usize) -> Result<(), ProblemError> {
        if k > self.num_segments() {
            return Err(ProblemError::InvalidKnotIndex {
                index: k,
                horizon: self.num_segments(),
            });
        }
        self.costs[k] = Some(cost);
        Ok(())
    }

    /// Register costs for all knots `0..=N` at once.
    pub fn set_cost_all(&mut self, costs: Vec<Rc<dyn CostFunction>>) -> Result<(), ProblemError> {
        if costs.len() != self.num_segments() + 1 {
            return Err(ProblemError::DimensionMismatch {
                expected: self.num_segments() + 1,
                got: costs.len(),
            });
        }
        for (k, cost) in costs.into_iter().enumerate() {
            self.costs[k] = Some(cost);
        }
        Ok(())
    }

    /// Add a constraint at knot `k in [0, N]`. Constraints accumulate; a
    /// knot may carry any number of them, including none.
    pub fn set_constraint(&mut self, con: Rc<dyn Constraint>, k: usize) -> Result<(), ProblemError> {
        if k > self.num_segments() {
            return Err(ProblemError::InvalidKnotIndex {
                index: k,
                horizon: self.num_segments(),
            });
        }
        if con.output_dimension() == 0 {
            return Err(ProblemError::EmptyConstraint {
                label: con.label().to_owned(),
            });
        }
        self.constraints[k].push(con);
        Ok(())
    }

    pub fn set_initial_state(&mut self, x0: DVector<f64>) {
        self.x0 = x0;
    }

    pub fn initial_state(&self) -> &DVector<f64> {
        &self.x0
    }

    pub fn dynamics(&self, k: usize) -> Option<&Rc<dyn DiscreteDynamics>> {
        self.models.get(k).and_then(|m| m.as_ref())
    }

    pub fn cost(&self, k: usize) -> Option<&Rc<dyn CostFunction>> {
        self.costs.get(k).and_then(|c| c.as_ref())
    }

    pub fn constraints(&self, k: usize) -> &[Rc<dyn Constraint>] {
        &self.constraints[k]
    }

    /// Sum of constraint output dimensions at knot `k`.
    pub fn num_constraints(&self, k: usize) -> usize {
        self.constraints[k]
            .iter()
            .map(|c| c.output_dimension())
            .sum()
    }

    /// True when every segment has dynamics and a cost, the terminal knot
    /// has a cost, and the initial state matches the dynamics dimension.
    pub fn is_fully_defined(&self) -> bool {
        let costs_ok = self.costs.iter().all(|c| c.is_some());
        let models_ok = self.models.iter().all(|m| m.is_some());
        let x0_ok = self
            .models
            .first()
            .and_then(|m| m.as_ref())
            .map(|m| m.state_dimension() == self.x0.len())
            .unwrap_or(false);
        costs_ok && models_ok && x0_ok
    }
}
