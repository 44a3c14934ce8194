use std::rc::Rc;
use std::time::Instant;

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector};

use crate::alg::{SolveStats, SolveStatus};
use crate::cost::CostFunction;
use crate::dynamics::DiscreteDynamics;
use crate::observer::{SolverObserver, SolverStep};
use crate::options::{RegularizationMode, SolverOptions};
use crate::problem::{Problem, ProblemError};
use crate::trajectory::Trajectory;

/// Per-knot expansions and backward-pass outputs.
///
/// Everything is sized at construction; the solve loop only writes in
/// place.
struct KnotData {
    cost: Rc<dyn CostFunction>,

    // cost expansion at the nominal trajectory
    lx: DVector<f64>,
    lu: DVector<f64>,
    lxx: DMatrix<f64>,
    luu: DMatrix<f64>,
    lxu: DMatrix<f64>,
    // dynamics Jacobian [A | B], n x (n + m)
    jac: DMatrix<f64>,

    // action-value expansion
    qx: DVector<f64>,
    qu: DVector<f64>,
    qxx: DMatrix<f64>,
    quu: DMatrix<f64>,
    qux: DMatrix<f64>,
    quu_reg: DMatrix<f64>,
    qux_reg: DMatrix<f64>,

    // local affine policy: u = u_bar + alpha * ff + gain * (x - x_bar)
    gain: DMatrix<f64>,
    ff: DVector<f64>,

    // cost-to-go expansion
    p_mat: DMatrix<f64>,
    p_vec: DVector<f64>,
}

impl KnotData {
    fn new(cost: Rc<dyn CostFunction>, n: usize, m: usize) -> Self {
        Self {
            cost,
            lx: DVector::zeros(n),
            lu: DVector::zeros(m),
            lxx: DMatrix::zeros(n, n),
            luu: DMatrix::zeros(m, m),
            lxu: DMatrix::zeros(n, m),
            jac: DMatrix::zeros(n, n + m),
            qx: DVector::zeros(n),
            qu: DVector::zeros(m),
            qxx: DMatrix::zeros(n, n),
            quu: DMatrix::zeros(m, m),
            qux: DMatrix::zeros(m, n),
            quu_reg: DMatrix::zeros(m, m),
            qux_reg: DMatrix::zeros(m, n),
            gain: DMatrix::zeros(m, n),
            ff: DVector::zeros(m),
            p_mat: DMatrix::zeros(n, n),
            p_vec: DVector::zeros(n),
        }
    }
}

/// Shared temporaries for the backward and forward passes.
struct Scratch {
    pa: DMatrix<f64>,    // P' * A
    pb: DMatrix<f64>,    // P' * B
    quu_k: DMatrix<f64>, // Q_uu * K
    quu_d: DVector<f64>, // Q_uu * d
    chol: DMatrix<f64>,
    xnext: DVector<f64>,
    dx: DVector<f64>,
    du: DVector<f64>,
}

impl Scratch {
    fn new(n: usize, m: usize) -> Self {
        Self {
            pa: DMatrix::zeros(n, n),
            pb: DMatrix::zeros(n, m),
            quu_k: DMatrix::zeros(m, n),
            quu_d: DVector::zeros(m),
            chol: DMatrix::zeros(m, m),
            xnext: DVector::zeros(n),
            dx: DVector::zeros(n),
            du: DVector::zeros(m),
        }
    }
}

enum ForwardOutcome {
    Accepted { alpha: f64, cost: f64 },
    /// No step was accepted; `cost_increased` is true when every candidate
    /// strictly increased the cost.
    Failed { cost_increased: bool },
}

/// Iterative LQR solver over a fixed horizon.
///
/// Construction clones the problem's cost and dynamics handles and sizes
/// all workspace buffers; the problem itself is not retained. The solver
/// owns the trajectory being optimized: inject a starting guess with
/// [`set_trajectory`](Ilqr::set_trajectory), propagate its states with
/// [`rollout`](Ilqr::rollout), then call [`solve`](Ilqr::solve).
pub struct Ilqr {
    opts: SolverOptions,
    n: usize,
    m: usize,
    x0: DVector<f64>,
    knots: Vec<KnotData>,
    models: Vec<Rc<dyn DiscreteDynamics>>,
    z: Trajectory,
    z_bar: Trajectory,
    rho: f64,
    stats: SolveStats,
    scratch: Scratch,
}

impl Ilqr {
    pub fn new(problem: &Problem, opts: SolverOptions) -> Result<Self, ProblemError> {
        if !problem.is_fully_defined() {
            return Err(ProblemError::NotFullyDefined);
        }
        let nseg = problem.num_segments();
        let model0 = problem.dynamics(0).ok_or(ProblemError::NotFullyDefined)?;
        let n = model0.state_dimension();
        let m = model0.control_dimension();

        let mut knots = Vec::with_capacity(nseg + 1);
        let mut models = Vec::with_capacity(nseg);
        for k in 0..=nseg {
            let cost = problem.cost(k).ok_or(ProblemError::NotFullyDefined)?;
            if cost.state_dimension() != n {
                return Err(ProblemError::DimensionMismatch {
                    expected: n,
                    got: cost.state_dimension(),
                });
            }
            if cost.control_dimension() != m {
                return Err(ProblemError::DimensionMismatch {
                    expected: m,
                    got: cost.control_dimension(),
                });
            }
            knots.push(KnotData::new(cost.clone(), n, m));
            if k < nseg {
                let model = problem.dynamics(k).ok_or(ProblemError::NotFullyDefined)?;
                if model.state_dimension() != n || model.control_dimension() != m {
                    return Err(ProblemError::DimensionMismatch {
                        expected: n,
                        got: model.state_dimension(),
                    });
                }
                models.push(model.clone());
            }
        }

        Ok(Self {
            rho: opts.rho_init,
            opts,
            n,
            m,
            x0: problem.initial_state().clone(),
            knots,
            models,
            z: Trajectory::new(n, m, nseg),
            z_bar: Trajectory::new(n, m, nseg),
            stats: SolveStats::default(),
            scratch: Scratch::new(n, m),
        })
    }

    pub fn num_segments(&self) -> usize {
        self.models.len()
    }

    pub fn state_dimension(&self) -> usize {
        self.n
    }

    pub fn control_dimension(&self) -> usize {
        self.m
    }

    pub fn options(&self) -> &SolverOptions {
        &self.opts
    }

    pub fn options_mut(&mut self) -> &mut SolverOptions {
        &mut self.opts
    }

    pub fn stats(&self) -> &SolveStats {
        &self.stats
    }

    /// The current (best) trajectory.
    pub fn trajectory(&self) -> &Trajectory {
        &self.z
    }

    /// Replace the trajectory being optimized. Steps and dimensions must
    /// match the problem the solver was built from.
    pub fn set_trajectory(&mut self, z: Trajectory) -> Result<(), ProblemError> {
        if z.state_dimension() != self.n {
            return Err(ProblemError::DimensionMismatch {
                expected: self.n,
                got: z.state_dimension(),
            });
        }
        if z.control_dimension() != self.m {
            return Err(ProblemError::DimensionMismatch {
                expected: self.m,
                got: z.control_dimension(),
            });
        }
        if z.num_segments() != self.num_segments() {
            return Err(ProblemError::DimensionMismatch {
                expected: self.num_segments(),
                got: z.num_segments(),
            });
        }
        self.z_bar = z.clone();
        self.z = z;
        Ok(())
    }

    /// Open-loop rollout: propagate the dynamics from the initial state
    /// through the current controls.
    pub fn rollout(&mut self) {
        self.z.state_mut(0).copy_from(&self.x0);
        for k in 0..self.num_segments() {
            self.models[k].evaluate(
                self.z.state(k),
                self.z.control(k),
                self.z.step(k),
                &mut self.scratch.xnext,
            );
            self.z.state_mut(k + 1).copy_from(&self.scratch.xnext);
        }
    }

    /// Total cost of a trajectory under the solver's cost functions.
    pub fn cost(&self) -> f64 {
        self.total_cost(&self.z)
    }

    fn total_cost(&self, z: &Trajectory) -> f64 {
        let mut cost = 0.0;
        for (k, knot) in self.knots.iter().enumerate() {
            cost += knot.cost.evaluate(z.state(k), z.control(k));
        }
        cost
    }

    pub fn solve(&mut self) -> SolveStatus {
        self.solve_observe(&mut ())
    }

    pub fn solve_observe<O: SolverObserver>(&mut self, observer: &mut O) -> SolveStatus {
        let start = Instant::now();
        self.rho = self.opts.rho_init;
        self.stats = SolveStats::default();

        let mut j = self.total_cost(&self.z);
        self.stats.cost = j;
        if !j.is_finite() || !self.z.is_finite() {
            return self.finish(SolveStatus::StateNotFinite, start);
        }

        let mut iteration = 0;
        let status = loop {
            if iteration >= self.opts.max_iterations_inner {
                break SolveStatus::MaxIterations;
            }
            iteration += 1;
            self.stats.iterations = iteration;

            self.update_expansion();
            let (dv1, dv2) = match self.backward_pass() {
                Ok(dv) => dv,
                Err(status) => break status,
            };
            let gradient = self.stationarity();
            self.stats.gradient = gradient;

            // Stationary point: the backward pass promises less improvement
            // than the cost tolerance, so a forward pass cannot help.
            let expected = -(dv1 + dv2);
            if gradient < self.opts.tol_grad && expected.abs() < self.opts.tol_cost {
                break SolveStatus::Converged;
            }

            match self.forward_pass(j, dv1, dv2) {
                ForwardOutcome::Accepted { alpha, cost } => {
                    let decrease = j - cost;
                    j = cost;
                    self.stats.cost = j;
                    self.stats.cost_decrease = decrease;
                    // the step worked, so relax the damping
                    self.decrease_regularization();
                    debug!(
                        "it {iteration:>3}  cost {j:.6e}  dJ {decrease:.3e}  grad {gradient:.3e}  alpha {alpha:.4}  rho {:.1e}",
                        self.rho
                    );
                    observer.on_step(SolverStep::Inner {
                        iteration,
                        cost: j,
                        cost_decrease: decrease,
                        gradient,
                        alpha,
                        rho: self.rho,
                        trajectory: &self.z,
                    });
                    if decrease.abs() < self.opts.tol_cost && gradient < self.opts.tol_grad {
                        break SolveStatus::Converged;
                    }
                }
                ForwardOutcome::Failed { cost_increased } => {
                    if self.rho >= self.opts.rho_max {
                        break if cost_increased {
                            SolveStatus::CostIncrease
                        } else {
                            SolveStatus::LineSearchFailure
                        };
                    }
                    self.increase_regularization();
                    debug!(
                        "it {iteration:>3}  line search failed, rho -> {:.1e}",
                        self.rho
                    );
                }
            }

            if observer.abort_requested() {
                break SolveStatus::UserAborted;
            }
            if let Some(budget) = self.opts.max_solve_time {
                if start.elapsed() >= budget {
                    break SolveStatus::MaxIterations;
                }
            }
        };
        self.finish(status, start)
    }

    fn finish(&mut self, status: SolveStatus, start: Instant) -> SolveStatus {
        self.stats.status = status;
        self.stats.solve_time = start.elapsed();
        status
    }

    /// Refresh the cost expansions and dynamics Jacobians at the nominal
    /// trajectory.
    fn update_expansion(&mut self) {
        let nseg = self.num_segments();
        for k in 0..=nseg {
            let knot = &mut self.knots[k];
            let (x, u) = (self.z.state(k), self.z.control(k));
            knot.cost.gradient(x, u, &mut knot.lx, &mut knot.lu);
            knot
                .cost
                .hessian(x, u, &mut knot.lxx, &mut knot.luu, &mut knot.lxu);
            if k < nseg {
                self.models[k].jacobian(x, u, self.z.step(k), &mut knot.jac);
            }
        }
    }

    /// Riccati sweep with retries: on an indefinite `Q_uu` the damping is
    /// raised and the sweep restarts from the terminal knot.
    fn backward_pass(&mut self) -> Result<(f64, f64), SolveStatus> {
        loop {
            match self.try_backward_pass() {
                Ok(dv) => return Ok(dv),
                Err(()) => {
                    if self.rho >= self.opts.rho_max {
                        return Err(SolveStatus::BackwardPassRegFailure);
                    }
                    self.increase_regularization();
                    debug!("backward pass failed, rho -> {:.1e}", self.rho);
                }
            }
        }
    }

    fn try_backward_pass(&mut self) -> Result<(f64, f64), ()> {
        let nseg = self.num_segments();
        let (n, m) = (self.n, self.m);

        {
            let term = &mut self.knots[nseg];
            term.p_mat.copy_from(&term.lxx);
            term.p_vec.copy_from(&term.lx);
        }

        let mut dv1 = 0.0;
        let mut dv2 = 0.0;
        for k in (0..nseg).rev() {
            let (head, tail) = self.knots.split_at_mut(k + 1);
            let knot = &mut head[k];
            let next = &tail[0];
            let a = knot.jac.columns(0, n);
            let b = knot.jac.columns(n, m);

            self.scratch.pa.gemm(1.0, &next.p_mat, &a, 0.0);
            self.scratch.pb.gemm(1.0, &next.p_mat, &b, 0.0);

            knot.qx.copy_from(&knot.lx);
            knot.qx.gemv_tr(1.0, &a, &next.p_vec, 1.0);
            knot.qu.copy_from(&knot.lu);
            knot.qu.gemv_tr(1.0, &b, &next.p_vec, 1.0);
            knot.qxx.copy_from(&knot.lxx);
            knot.qxx.gemm_tr(1.0, &a, &self.scratch.pa, 1.0);
            knot.quu.copy_from(&knot.luu);
            knot.quu.gemm_tr(1.0, &b, &self.scratch.pb, 1.0);
            knot.lxu.transpose_to(&mut knot.qux);
            knot.qux.gemm_tr(1.0, &b, &self.scratch.pa, 1.0);

            knot.quu_reg.copy_from(&knot.quu);
            knot.qux_reg.copy_from(&knot.qux);
            match self.opts.regularization_mode {
                RegularizationMode::Control => {
                    for i in 0..m {
                        knot.quu_reg[(i, i)] += self.rho;
                    }
                }
                RegularizationMode::State => {
                    knot.quu_reg.gemm_tr(self.rho, &b, &b, 1.0);
                    knot.qux_reg.gemm_tr(self.rho, &b, &a, 1.0);
                }
                RegularizationMode::Both => {
                    knot.quu_reg.gemm_tr(self.rho, &b, &b, 1.0);
                    knot.qux_reg.gemm_tr(self.rho, &b, &a, 1.0);
                    for i in 0..m {
                        knot.quu_reg[(i, i)] += self.rho;
                    }
                }
            }

            self.scratch.chol.copy_from(&knot.quu_reg);
            let buf = std::mem::replace(&mut self.scratch.chol, DMatrix::zeros(0, 0));
            let Some(chol) = Cholesky::new(buf) else {
                self.scratch.chol = DMatrix::zeros(m, m);
                return Err(());
            };
            knot.ff.copy_from(&knot.qu);
            chol.solve_mut(&mut knot.ff);
            knot.ff.neg_mut();
            knot.gain.copy_from(&knot.qux_reg);
            chol.solve_mut(&mut knot.gain);
            knot.gain.neg_mut();
            self.scratch.chol = chol.unpack();

            // Cost-to-go from the unregularized expansion with the damped
            // gains.
            self.scratch.quu_k.gemm(1.0, &knot.quu, &knot.gain, 0.0);
            self.scratch.quu_d.gemv(1.0, &knot.quu, &knot.ff, 0.0);

            knot.p_mat.copy_from(&knot.qxx);
            knot.p_mat.gemm_tr(1.0, &knot.gain, &self.scratch.quu_k, 1.0);
            knot.p_mat.gemm_tr(1.0, &knot.gain, &knot.qux, 1.0);
            knot.p_mat.gemm_tr(1.0, &knot.qux, &knot.gain, 1.0);
            symmetrize(&mut knot.p_mat);

            knot.p_vec.copy_from(&knot.qx);
            knot.p_vec.gemv_tr(1.0, &knot.gain, &self.scratch.quu_d, 1.0);
            knot.p_vec.gemv_tr(1.0, &knot.gain, &knot.qu, 1.0);
            knot.p_vec.gemv_tr(1.0, &knot.qux, &knot.ff, 1.0);

            dv1 += knot.ff.dot(&knot.qu);
            dv2 += 0.5 * knot.ff.dot(&self.scratch.quu_d);
        }
        Ok((dv1, dv2))
    }

    /// Scaled stationarity measure `max_k |d_k|_inf / (1 + |u_k|_inf)`.
    fn stationarity(&self) -> f64 {
        let mut grad: f64 = 0.0;
        for k in 0..self.num_segments() {
            let d = self.knots[k].ff.amax();
            let u = self.z.control(k).amax();
            grad = grad.max(d / (1.0 + u));
        }
        grad
    }

    /// Backtracking line search over the closed-loop rollout.
    fn forward_pass(&mut self, j_current: f64, dv1: f64, dv2: f64) -> ForwardOutcome {
        let c_low = self.opts.linesearch_decrease_low;
        let c_high = self.opts.linesearch_decrease_high;
        let tau = self.opts.linesearch_contraction;
        let alpha_min = self.opts.linesearch_step_min;

        let mut alpha = 1.0;
        let mut cost_increased = true;
        while alpha >= alpha_min {
            if let Some(j_new) = self.closed_loop_rollout(alpha) {
                if j_new < j_current {
                    cost_increased = false;
                }
                let expected = -(alpha * dv1 + alpha * alpha * dv2);
                let accept = if expected > 0.0 {
                    let ratio = (j_current - j_new) / expected;
                    j_new < j_current && ratio >= c_low && ratio <= c_high
                } else {
                    // The model promises nothing; settle for any strict
                    // decrease.
                    j_new < j_current
                };
                if accept {
                    std::mem::swap(&mut self.z, &mut self.z_bar);
                    return ForwardOutcome::Accepted {
                        alpha,
                        cost: j_new,
                    };
                }
            }
            alpha *= tau;
        }
        ForwardOutcome::Failed { cost_increased }
    }

    /// Simulate `u = u_bar + alpha * d + K (x - x_bar)` into the candidate
    /// trajectory. Returns the candidate cost, or `None` if any state or
    /// the cost went non-finite.
    fn closed_loop_rollout(&mut self, alpha: f64) -> Option<f64> {
        let nseg = self.num_segments();
        self.z_bar.state_mut(0).copy_from(&self.x0);
        let mut cost = 0.0;
        for k in 0..nseg {
            self.scratch.dx.copy_from(self.z_bar.state(k));
            self.scratch.dx -= self.z.state(k);
            self.scratch.du.copy_from(&self.knots[k].ff);
            self.scratch.du *= alpha;
            self.scratch
                .du
                .gemv(1.0, &self.knots[k].gain, &self.scratch.dx, 1.0);

            let u = self.z_bar.control_mut(k);
            u.copy_from(self.z.control(k));
            *u += &self.scratch.du;

            cost += self.knots[k]
                .cost
                .evaluate(self.z_bar.state(k), self.z_bar.control(k));

            self.models[k].evaluate(
                self.z_bar.state(k),
                self.z_bar.control(k),
                self.z.step(k),
                &mut self.scratch.xnext,
            );
            if !self.scratch.xnext.iter().all(|v| v.is_finite()) {
                return None;
            }
            self.z_bar.state_mut(k + 1).copy_from(&self.scratch.xnext);
        }
        cost += self.knots[nseg]
            .cost
            .evaluate(self.z_bar.state(nseg), self.z_bar.control(nseg));
        cost.is_finite().then_some(cost)
    }

    fn increase_regularization(&mut self) {
        self.rho = (self.rho * self.opts.rho_scale)
            .max(self.opts.rho_min)
            .min(self.opts.rho_max);
    }

    fn decrease_regularization(&mut self) {
        self.rho = (self.rho / self.opts.rho_scale).max(self.opts.rho_min);
    }
}

fn symmetrize(mat: &mut DMatrix<f64>) {
    for i in 0..mat.nrows() {
        for j in (i + 1)..mat.ncols() {
            let avg = 0.5 * (mat[(i, j)] + mat[(j, i)]);
            mat[(i, j)] = avg;
            mat[(j, i)] = avg;
        }
    }
}
