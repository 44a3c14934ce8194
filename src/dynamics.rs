use std::cell::RefCell;

use nalgebra::{DMatrix, DVector};

use crate::function::VectorFunction;

/// Continuous-time dynamics `xdot = f(x, u)`.
///
/// The [`VectorFunction`] evaluation is the state derivative; the Jacobian
/// is `df/d[x, u]`, sized `n x (n + m)`.
pub trait ContinuousDynamics: VectorFunction {
    fn state_dimension(&self) -> usize;
    fn control_dimension(&self) -> usize;
}

/// Discrete-time dynamics `x_{k+1} = F(x_k, u_k, h_k)`.
///
/// The Jacobian is `dF/d[x, u]`, sized `n x (n + m)`; the step `h` is a
/// parameter, not a differentiation variable.
pub trait DiscreteDynamics {
    fn state_dimension(&self) -> usize;
    fn control_dimension(&self) -> usize;

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, h: f64, x_next: &mut DVector<f64>);

    fn jacobian(&self, x: &DVector<f64>, u: &DVector<f64>, h: f64, out: &mut DMatrix<f64>);
}

/// Stage storage for an explicit integration scheme, sized once per model.
pub struct IntegratorWorkspace {
    k: [DVector<f64>; 4],
    xtmp: DVector<f64>,
    // stage Jacobian [A_i B_i] and the accumulated dk/dx, dk/du per stage
    jac: DMatrix<f64>,
    dkdx: [DMatrix<f64>; 4],
    dkdu: [DMatrix<f64>; 4],
}

impl IntegratorWorkspace {
    pub fn new(n: usize, m: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| DVector::zeros(n)),
            xtmp: DVector::zeros(n),
            jac: DMatrix::zeros(n, n + m),
            dkdx: std::array::from_fn(|_| DMatrix::zeros(n, n)),
            dkdu: std::array::from_fn(|_| DMatrix::zeros(n, m)),
        }
    }
}

/// Explicit fixed-step integration scheme.
///
/// Implementations advance the state by one step and differentiate that map
/// exactly (chain rule through the stages), so the discrete Jacobian is
/// consistent with the discrete dynamics to machine precision.
pub trait ExplicitIntegrator {
    fn integrate(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
        x_next: &mut DVector<f64>,
    );

    fn jacobian(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
        out: &mut DMatrix<f64>,
    );
}

/// The classic fourth-order Runge-Kutta scheme. Reference integrator.
#[derive(Clone, Copy, Debug, Default)]
pub struct RungeKutta4;

impl RungeKutta4 {
    /// Evaluate the four stage derivatives at `(x, u, h)` into `work.k`.
    fn stages(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
    ) {
        let [k1, k2, k3, k4] = &mut work.k;
        model.evaluate(x, u, k1);
        work.xtmp.copy_from(x);
        work.xtmp.axpy(0.5 * h, k1, 1.0);
        model.evaluate(&work.xtmp, u, k2);
        work.xtmp.copy_from(x);
        work.xtmp.axpy(0.5 * h, k2, 1.0);
        model.evaluate(&work.xtmp, u, k3);
        work.xtmp.copy_from(x);
        work.xtmp.axpy(h, k3, 1.0);
        model.evaluate(&work.xtmp, u, k4);
    }
}

impl ExplicitIntegrator for RungeKutta4 {
    fn integrate(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
        x_next: &mut DVector<f64>,
    ) {
        self.stages(model, work, x, u, h);
        let [k1, k2, k3, k4] = &work.k;
        x_next.copy_from(x);
        x_next.axpy(h / 6.0, k1, 1.0);
        x_next.axpy(h / 3.0, k2, 1.0);
        x_next.axpy(h / 3.0, k3, 1.0);
        x_next.axpy(h / 6.0, k4, 1.0);
    }

    fn jacobian(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
        out: &mut DMatrix<f64>,
    ) {
        let n = model.state_dimension();
        let m = model.control_dimension();
        assert_eq!(out.nrows(), n, "discrete Jacobian must have n rows");
        assert_eq!(out.ncols(), n + m, "discrete Jacobian must have n + m columns");

        self.stages(model, work, x, u, h);

        // Stage 1 at x.
        model.jacobian(x, u, &mut work.jac);
        let (a, b) = (work.jac.columns(0, n), work.jac.columns(n, m));
        work.dkdx[0].copy_from(&a);
        work.dkdu[0].copy_from(&b);

        // Stages 2..4 at the intermediate points, chained through the
        // previous stage sensitivities.
        for s in 1..4 {
            let scale = if s < 3 { 0.5 * h } else { h };
            work.xtmp.copy_from(x);
            work.xtmp.axpy(scale, &work.k[s - 1], 1.0);
            model.jacobian(&work.xtmp, u, &mut work.jac);
            let (a, b) = (work.jac.columns(0, n), work.jac.columns(n, m));

            let (head, tail) = work.dkdx.split_at_mut(s);
            tail[0].copy_from(&a);
            tail[0].gemm(scale, &a, &head[s - 1], 1.0);

            let (head, tail) = work.dkdu.split_at_mut(s);
            tail[0].copy_from(&b);
            tail[0].gemm(scale, &a, &head[s - 1], 1.0);
        }

        out.fill(0.0);
        let mut dfdx = out.columns_mut(0, n);
        dfdx.fill_diagonal(1.0);
        for (s, weight) in [(0, h / 6.0), (1, h / 3.0), (2, h / 3.0), (3, h / 6.0)] {
            dfdx.zip_apply(&work.dkdx[s], |o, v| *o += weight * v);
        }
        let mut dfdu = out.columns_mut(n, m);
        for (s, weight) in [(0, h / 6.0), (1, h / 3.0), (2, h / 3.0), (3, h / 6.0)] {
            dfdu.zip_apply(&work.dkdu[s], |o, v| *o += weight * v);
        }
    }
}

/// Forward Euler. Cheaper and less accurate than [`RungeKutta4`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ExplicitEuler;

impl ExplicitIntegrator for ExplicitEuler {
    fn integrate(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
        x_next: &mut DVector<f64>,
    ) {
        model.evaluate(x, u, &mut work.k[0]);
        x_next.copy_from(x);
        x_next.axpy(h, &work.k[0], 1.0);
    }

    fn jacobian(
        &self,
        model: &dyn ContinuousDynamics,
        work: &mut IntegratorWorkspace,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: f64,
        out: &mut DMatrix<f64>,
    ) {
        let n = model.state_dimension();
        model.jacobian(x, u, &mut work.jac);
        out.fill(0.0);
        out.columns_mut(0, n).fill_diagonal(1.0);
        out.zip_apply(&work.jac, |o, v| *o += h * v);
    }
}

/// A continuous model discretized by an explicit integrator.
///
/// This is what a [`Problem`](crate::problem::Problem) stores per segment.
/// The workspace lives behind a `RefCell` so a single discretized model can
/// be shared across all knots of a single-threaded solve.
pub struct DiscretizedModel<M, I = RungeKutta4> {
    model: M,
    integrator: I,
    work: RefCell<IntegratorWorkspace>,
}

impl<M: ContinuousDynamics> DiscretizedModel<M, RungeKutta4> {
    pub fn rk4(model: M) -> Self {
        Self::new(model, RungeKutta4)
    }
}

impl<M: ContinuousDynamics, I: ExplicitIntegrator> DiscretizedModel<M, I> {
    pub fn new(model: M, integrator: I) -> Self {
        let work = RefCell::new(IntegratorWorkspace::new(
            model.state_dimension(),
            model.control_dimension(),
        ));
        Self {
            model,
            integrator,
            work,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: ContinuousDynamics, I: ExplicitIntegrator> DiscreteDynamics for DiscretizedModel<M, I> {
    fn state_dimension(&self) -> usize {
        self.model.state_dimension()
    }

    fn control_dimension(&self) -> usize {
        self.model.control_dimension()
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, h: f64, x_next: &mut DVector<f64>) {
        let mut work = self.work.borrow_mut();
        self.integrator
            .integrate(&self.model, &mut work, x, u, h, x_next);
    }

    fn jacobian(&self, x: &DVector<f64>, u: &DVector<f64>, h: f64, out: &mut DMatrix<f64>) {
        let mut work = self.work.borrow_mut();
        self.integrator
            .jacobian(&self.model, &mut work, x, u, h, out);
    }
}

/// Adapter fixing the step of a discrete model so its Jacobian can be
/// checked with [`check_jacobian`](crate::function::check_jacobian).
pub struct FrozenStep<'a> {
    model: &'a dyn DiscreteDynamics,
    h: f64,
}

impl<'a> FrozenStep<'a> {
    pub fn new(model: &'a dyn DiscreteDynamics, h: f64) -> Self {
        Self { model, h }
    }
}

impl VectorFunction for FrozenStep<'_> {
    fn output_dimension(&self) -> usize {
        self.model.state_dimension()
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DVector<f64>) {
        self.model.evaluate(x, u, self.h, out);
    }

    fn jacobian(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DMatrix<f64>) {
        self.model.jacobian(x, u, self.h, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::check_jacobian;

    /// Damped pendulum: `x = (theta, omega)`, `u = torque`.
    struct Pendulum;

    impl VectorFunction for Pendulum {
        fn output_dimension(&self) -> usize {
            2
        }

        fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DVector<f64>) {
            out[0] = x[1];
            out[1] = -9.81 * x[0].sin() - 0.1 * x[1] + u[0];
        }

        fn jacobian(&self, x: &DVector<f64>, _u: &DVector<f64>, out: &mut DMatrix<f64>) {
            out.fill(0.0);
            out[(0, 1)] = 1.0;
            out[(1, 0)] = -9.81 * x[0].cos();
            out[(1, 1)] = -0.1;
            out[(1, 2)] = 1.0;
        }
    }

    impl ContinuousDynamics for Pendulum {
        fn state_dimension(&self) -> usize {
            2
        }
        fn control_dimension(&self) -> usize {
            1
        }
    }

    /// Double integrator: RK4 integrates polynomial dynamics exactly.
    struct DoubleIntegrator;

    impl VectorFunction for DoubleIntegrator {
        fn output_dimension(&self) -> usize {
            2
        }
        fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DVector<f64>) {
            out[0] = x[1];
            out[1] = u[0];
        }
        fn jacobian(&self, _x: &DVector<f64>, _u: &DVector<f64>, out: &mut DMatrix<f64>) {
            out.fill(0.0);
            out[(0, 1)] = 1.0;
            out[(1, 2)] = 1.0;
        }
    }

    impl ContinuousDynamics for DoubleIntegrator {
        fn state_dimension(&self) -> usize {
            2
        }
        fn control_dimension(&self) -> usize {
            1
        }
    }

    #[test]
    fn rk4_is_exact_on_the_double_integrator() {
        let model = DiscretizedModel::rk4(DoubleIntegrator);
        let x = DVector::from_vec(vec![1.0, -2.0]);
        let u = DVector::from_vec(vec![3.0]);
        let h = 0.1;
        let mut x_next = DVector::zeros(2);
        model.evaluate(&x, &u, h, &mut x_next);
        assert!((x_next[0] - (1.0 - 2.0 * h + 0.5 * 3.0 * h * h)).abs() < 1e-14);
        assert!((x_next[1] - (-2.0 + 3.0 * h)).abs() < 1e-14);
    }

    #[test]
    fn rk4_jacobian_matches_finite_difference() {
        let model = DiscretizedModel::rk4(Pendulum);
        let x = DVector::from_vec(vec![0.4, -1.1]);
        let u = DVector::from_vec(vec![0.7]);
        let frozen = FrozenStep::new(&model, 0.05);
        let err = check_jacobian(&frozen, &x, &u, 1e-6);
        assert!(err < 1e-6, "discrete Jacobian error {err}");
    }

    #[test]
    fn euler_jacobian_matches_finite_difference() {
        let model = DiscretizedModel::new(Pendulum, ExplicitEuler);
        let x = DVector::from_vec(vec![-0.3, 0.9]);
        let u = DVector::from_vec(vec![-0.2]);
        let frozen = FrozenStep::new(&model, 0.05);
        let err = check_jacobian(&frozen, &x, &u, 1e-6);
        assert!(err < 1e-6, "discrete Jacobian error {err}");
    }

    #[test]
    fn jacobian_dimensions_are_n_by_n_plus_m() {
        let model = DiscretizedModel::rk4(Pendulum);
        let mut jac = DMatrix::zeros(2, 3);
        model.jacobian(
            &DVector::zeros(2),
            &DVector::zeros(1),
            0.1,
            &mut jac,
        );
        assert_eq!((jac.nrows(), jac.ncols()), (2, 3));
    }
}
