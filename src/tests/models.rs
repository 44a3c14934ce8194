use nalgebra::{DMatrix, DVector};

use crate::dynamics::{ContinuousDynamics, DiscreteDynamics};
use crate::function::VectorFunction;

/// A chain of three integrators per degree of freedom; the control is the
/// jerk. State layout: positions, then velocities, then accelerations.
pub struct TripleIntegrator {
    dof: usize,
}

impl TripleIntegrator {
    pub fn new(dof: usize) -> Self {
        Self { dof }
    }
}

impl VectorFunction for TripleIntegrator {
    fn output_dimension(&self) -> usize {
        3 * self.dof
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DVector<f64>) {
        let dof = self.dof;
        for i in 0..2 * dof {
            out[i] = x[i + dof];
        }
        for i in 0..dof {
            out[2 * dof + i] = u[i];
        }
    }

    fn jacobian(&self, _x: &DVector<f64>, _u: &DVector<f64>, out: &mut DMatrix<f64>) {
        let dof = self.dof;
        let n = 3 * dof;
        out.fill(0.0);
        for i in 0..2 * dof {
            out[(i, i + dof)] = 1.0;
        }
        for i in 0..dof {
            out[(2 * dof + i, n + i)] = 1.0;
        }
    }
}

impl ContinuousDynamics for TripleIntegrator {
    fn state_dimension(&self) -> usize {
        3 * self.dof
    }
    fn control_dimension(&self) -> usize {
        self.dof
    }
}

/// Kinematic unicycle: state `(x, y, theta)`, controls `(v, omega)`.
pub struct Unicycle;

impl VectorFunction for Unicycle {
    fn output_dimension(&self) -> usize {
        3
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DVector<f64>) {
        let theta = x[2];
        out[0] = u[0] * theta.cos();
        out[1] = u[0] * theta.sin();
        out[2] = u[1];
    }

    fn jacobian(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DMatrix<f64>) {
        let theta = x[2];
        out.fill(0.0);
        out[(0, 2)] = -u[0] * theta.sin();
        out[(1, 2)] = u[0] * theta.cos();
        out[(0, 3)] = theta.cos();
        out[(1, 3)] = theta.sin();
        out[(2, 4)] = 1.0;
    }
}

impl ContinuousDynamics for Unicycle {
    fn state_dimension(&self) -> usize {
        3
    }
    fn control_dimension(&self) -> usize {
        2
    }
}

/// A discrete linear system `x_{k+1} = A x_k + B u_k` (the step is
/// ignored).
pub struct DiscreteLti {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
}

impl DiscreteDynamics for DiscreteLti {
    fn state_dimension(&self) -> usize {
        self.a.nrows()
    }

    fn control_dimension(&self) -> usize {
        self.b.ncols()
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, _h: f64, x_next: &mut DVector<f64>) {
        x_next.gemv(1.0, &self.a, x, 0.0);
        x_next.gemv(1.0, &self.b, u, 1.0);
    }

    fn jacobian(&self, _x: &DVector<f64>, _u: &DVector<f64>, _h: f64, out: &mut DMatrix<f64>) {
        let n = self.a.nrows();
        let m = self.b.ncols();
        out.columns_mut(0, n).copy_from(&self.a);
        out.columns_mut(n, m).copy_from(&self.b);
    }
}

/// Deterministic pseudo-random stream in `[-1, 1)` for reproducible
/// fixtures.
pub fn lcg(seed: u64) -> impl FnMut() -> f64 {
    let mut state = seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493);
    move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) as f64 / (1u64 << 30) as f64 - 1.0
    }
}

/// A strictly positive definite matrix `L L' + eps I` with pseudo-random
/// `L`.
pub fn random_spd(n: usize, eps: f64, next: &mut impl FnMut() -> f64) -> DMatrix<f64> {
    let l = DMatrix::from_fn(n, n, |_, _| next());
    &l * l.transpose() + DMatrix::identity(n, n) * eps
}
