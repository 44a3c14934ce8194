use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::alg::ilqr::Ilqr;
use crate::alg::{SolveStats, SolveStatus};
use crate::cone::Cone;
use crate::constraint::Constraint;
use crate::cost::CostFunction;
use crate::observer::{SolverObserver, SolverStep};
use crate::options::SolverOptions;
use crate::problem::{Problem, ProblemError};
use crate::trajectory::Trajectory;

/// Multiplier and penalty state for one constraint at one knot.
///
/// Sign convention: constraints satisfy `c in K` with `K` the constraint's
/// cone (`c = 0` or `c <= 0`); multipliers live in the polar of `K`, which
/// the projected update `lambda <- -proj_dual(-(lambda + mu c))` enforces by
/// construction (equality multipliers free, inequality multipliers >= 0).
struct ConstraintValues {
    con: Rc<dyn Constraint>,
    cone: Cone,
    knot: usize,
    lambda: DVector<f64>,
    penalty: f64,

    // evaluation buffers
    c: DVector<f64>,
    jac: DMatrix<f64>,
    /// `-(lambda + mu c)`, the dual-projection input.
    lambda_bar: DVector<f64>,
    /// Projected multiplier `-proj_dual(lambda_bar)`.
    lambda_hat: DVector<f64>,
    proj: DVector<f64>,
    proj_jac: DMatrix<f64>,
    jtmp: DMatrix<f64>,
}

impl ConstraintValues {
    fn new(con: Rc<dyn Constraint>, knot: usize, n: usize, m: usize, penalty: f64) -> Self {
        let p = con.output_dimension();
        Self {
            cone: con.cone(),
            con,
            knot,
            lambda: DVector::zeros(p),
            penalty,
            c: DVector::zeros(p),
            jac: DMatrix::zeros(p, n + m),
            lambda_bar: DVector::zeros(p),
            lambda_hat: DVector::zeros(p),
            proj: DVector::zeros(p),
            proj_jac: DMatrix::zeros(p, p),
            jtmp: DMatrix::zeros(p, n + m),
        }
    }

    /// Evaluate the constraint at `(x, u)` and refresh the projected
    /// multiplier.
    fn update(&mut self, x: &DVector<f64>, u: &DVector<f64>) {
        self.con.evaluate(x, u, &mut self.c);
        self.lambda_bar.copy_from(&self.lambda);
        self.lambda_bar.axpy(self.penalty, &self.c, 1.0);
        self.lambda_bar.neg_mut();
        self.cone.dual().project(&self.lambda_bar, &mut self.lambda_hat);
        self.lambda_hat.neg_mut();
    }

    /// Augmented Lagrangian value `(|lhat|^2 - |lambda|^2) / (2 mu)`.
    ///
    /// For equality constraints this is `lambda'c + (mu/2)|c|^2`; for
    /// inequalities it is the standard active-set penalty.
    fn al_cost(&mut self, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        self.update(x, u);
        (self.lambda_hat.norm_squared() - self.lambda.norm_squared()) / (2.0 * self.penalty)
    }

    /// Accumulate `J' lhat` into the cost gradient.
    fn add_gradient(
        &mut self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        dx: &mut DVector<f64>,
        du: &mut DVector<f64>,
    ) {
        self.update(x, u);
        self.con.jacobian(x, u, &mut self.jac);
        let n = dx.len();
        let m = du.len();
        dx.gemv_tr(1.0, &self.jac.columns(0, n), &self.lambda_hat, 1.0);
        du.gemv_tr(1.0, &self.jac.columns(n, m), &self.lambda_hat, 1.0);
    }

    /// Accumulate the Gauss-Newton term `mu J' D J`, with `D` the dual
    /// projection Jacobian (the active-set selector).
    fn add_hessian(
        &mut self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        dxdx: &mut DMatrix<f64>,
        dudu: &mut DMatrix<f64>,
        dxdu: &mut DMatrix<f64>,
    ) {
        self.update(x, u);
        self.con.jacobian(x, u, &mut self.jac);
        self.cone
            .dual()
            .projection_jacobian(&self.lambda_bar, &mut self.proj_jac);
        self.jtmp.gemm(1.0, &self.proj_jac, &self.jac, 0.0);

        let n = dxdx.nrows();
        let m = dudu.nrows();
        let mu = self.penalty;
        dxdx.gemm_tr(mu, &self.jac.columns(0, n), &self.jtmp.columns(0, n), 1.0);
        dudu.gemm_tr(mu, &self.jac.columns(n, m), &self.jtmp.columns(n, m), 1.0);
        dxdu.gemm_tr(mu, &self.jac.columns(0, n), &self.jtmp.columns(n, m), 1.0);
    }

    /// Distance of the last evaluation from the cone, in the max norm.
    fn violation(&mut self) -> f64 {
        self.cone.project(&self.c, &mut self.proj);
        let mut v: f64 = 0.0;
        for i in 0..self.c.len() {
            v = v.max((self.c[i] - self.proj[i]).abs());
        }
        v
    }

    /// Dual ascent: the projected multiplier *is* the updated multiplier.
    fn dual_update(&mut self) {
        self.lambda.copy_from(&self.lambda_hat);
    }

    fn penalty_update(&mut self, scale: f64, max: f64) {
        self.penalty = (self.penalty * scale).min(max);
    }
}

/// A stage cost augmented with the penalty and multiplier terms of the
/// constraints registered at its knot.
///
/// Holds the original cost untouched plus shared handles to the multiplier
/// state, which the outer solver updates between inner solves. Constraints
/// stay pure functions of `(x, u)`.
struct AlCost {
    cost: Rc<dyn CostFunction>,
    values: Vec<Rc<RefCell<ConstraintValues>>>,
}

impl CostFunction for AlCost {
    fn state_dimension(&self) -> usize {
        self.cost.state_dimension()
    }

    fn control_dimension(&self) -> usize {
        self.cost.control_dimension()
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        let mut cost = self.cost.evaluate(x, u);
        for cv in &self.values {
            cost += cv.borrow_mut().al_cost(x, u);
        }
        cost
    }

    fn gradient(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        dx: &mut DVector<f64>,
        du: &mut DVector<f64>,
    ) {
        self.cost.gradient(x, u, dx, du);
        for cv in &self.values {
            cv.borrow_mut().add_gradient(x, u, dx, du);
        }
    }

    fn hessian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        dxdx: &mut DMatrix<f64>,
        dudu: &mut DMatrix<f64>,
        dxdu: &mut DMatrix<f64>,
    ) {
        self.cost.hessian(x, u, dxdx, dudu, dxdu);
        for cv in &self.values {
            cv.borrow_mut().add_hessian(x, u, dxdx, dudu, dxdu);
        }
    }

    fn is_quadratic(&self) -> bool {
        // the active set makes the penalty piecewise quadratic
        self.values.is_empty() && self.cost.is_quadratic()
    }

    fn is_block_diagonal(&self) -> bool {
        self.values.is_empty() && self.cost.is_block_diagonal()
    }

    fn is_terminal(&self) -> bool {
        self.cost.is_terminal()
    }
}

/// Augmented Lagrangian solver: transforms a constrained problem into a
/// sequence of unconstrained solves with multiplier and penalty updates in
/// between.
///
/// Construction builds a *new* problem whose costs wrap the originals; the
/// problem passed in is never mutated.
pub struct AugmentedLagrangian {
    ilqr: Ilqr,
    values: Vec<Rc<RefCell<ConstraintValues>>>,
    opts: SolverOptions,
    stats: SolveStats,
}

impl AugmentedLagrangian {
    pub fn new(problem: &Problem, opts: SolverOptions) -> Result<Self, ProblemError> {
        if !problem.is_fully_defined() {
            return Err(ProblemError::NotFullyDefined);
        }
        let nseg = problem.num_segments();
        let model0 = problem.dynamics(0).ok_or(ProblemError::NotFullyDefined)?;
        let (n, m) = (model0.state_dimension(), model0.control_dimension());

        let mut al_problem = Problem::new(nseg);
        al_problem.set_initial_state(problem.initial_state().clone());
        let mut values = Vec::new();
        for k in 0..=nseg {
            let cost = problem.cost(k).ok_or(ProblemError::NotFullyDefined)?;
            let mut knot_values = Vec::new();
            for con in problem.constraints(k) {
                let cv = Rc::new(RefCell::new(ConstraintValues::new(
                    con.clone(),
                    k,
                    n,
                    m,
                    opts.penalty_init,
                )));
                knot_values.push(cv.clone());
                values.push(cv);
            }
            let wrapped: Rc<dyn CostFunction> = if knot_values.is_empty() {
                cost.clone()
            } else {
                Rc::new(AlCost {
                    cost: cost.clone(),
                    values: knot_values,
                })
            };
            al_problem.set_cost(wrapped, k)?;
            if k < nseg {
                let model = problem.dynamics(k).ok_or(ProblemError::NotFullyDefined)?;
                al_problem.set_dynamics(model.clone(), k)?;
            }
        }

        let ilqr = Ilqr::new(&al_problem, opts.clone())?;
        Ok(Self {
            ilqr,
            values,
            opts,
            stats: SolveStats::default(),
        })
    }

    pub fn set_trajectory(&mut self, z: Trajectory) -> Result<(), ProblemError> {
        self.ilqr.set_trajectory(z)
    }

    pub fn trajectory(&self) -> &Trajectory {
        self.ilqr.trajectory()
    }

    pub fn rollout(&mut self) {
        self.ilqr.rollout()
    }

    pub fn ilqr(&self) -> &Ilqr {
        &self.ilqr
    }

    pub fn ilqr_mut(&mut self) -> &mut Ilqr {
        &mut self.ilqr
    }

    pub fn stats(&self) -> &SolveStats {
        &self.stats
    }

    /// Largest penalty parameter across all constraints.
    pub fn max_penalty(&self) -> f64 {
        self.values
            .iter()
            .map(|cv| cv.borrow().penalty)
            .fold(0.0, f64::max)
    }

    /// Maximum constraint violation at the current trajectory.
    pub fn max_violation(&mut self) -> f64 {
        self.update_constraints()
    }

    pub fn solve(&mut self) -> SolveStatus {
        self.solve_observe(&mut ())
    }

    pub fn solve_observe<O: SolverObserver>(&mut self, observer: &mut O) -> SolveStatus {
        let start = Instant::now();
        self.stats = SolveStats::default();
        self.stats.violation = f64::INFINITY;

        let gamma = self.opts.violation_decrease_ratio;
        let mut tol_inner = self.opts.tol_inner.max(self.opts.tol_cost);
        let mut prev_viol = f64::INFINITY;

        let status = loop {
            if self.stats.outer_iterations >= self.opts.max_iterations_outer {
                break SolveStatus::MaxIterations;
            }
            let outer = self.stats.outer_iterations + 1;
            self.stats.outer_iterations = outer;

            self.ilqr.options_mut().tol_cost = tol_inner;
            let inner_status = self.ilqr.solve_observe(observer);
            self.stats.iterations += self.ilqr.stats().iterations;
            self.stats.cost = self.ilqr.stats().cost;
            self.stats.cost_decrease = self.ilqr.stats().cost_decrease;
            self.stats.gradient = self.ilqr.stats().gradient;
            if inner_status.is_error() {
                break inner_status;
            }

            let viol = self.update_constraints();
            self.stats.violation = viol;
            let converged = viol < self.opts.tol_viol && inner_status == SolveStatus::Converged;

            if !converged {
                for cv in &self.values {
                    cv.borrow_mut().dual_update();
                }
                // grow the penalties only when the violation stalls
                if viol > gamma * prev_viol {
                    for cv in &self.values {
                        cv.borrow_mut()
                            .penalty_update(self.opts.penalty_scale, self.opts.penalty_max);
                    }
                }
                prev_viol = viol;
                tol_inner = (tol_inner * gamma).max(self.opts.tol_cost);
            }

            debug!(
                "outer {outer:>2}  viol {viol:.3e}  penalty {:.1e}  inner {:?}",
                self.max_penalty(),
                inner_status
            );
            observer.on_step(SolverStep::Outer {
                iteration: outer,
                violation: viol,
                max_penalty: self.max_penalty(),
            });

            if converged {
                break SolveStatus::Converged;
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
        self.stats.status = status;
        self.stats.solve_time = start.elapsed();
        status
    }

    /// Re-evaluate every constraint at the current trajectory and return
    /// the maximum violation.
    fn update_constraints(&mut self) -> f64 {
        let z = self.ilqr.trajectory();
        let mut max_viol: f64 = 0.0;
        for cv in &self.values {
            let mut cv = cv.borrow_mut();
            let k = cv.knot;
            cv.update(z.state(k), z.control(k));
            max_viol = max_viol.max(cv.violation());
        }
        max_viol
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::{ControlBound, GoalConstraint};
    use crate::cost::QuadraticCost;

    fn quadratic(n: usize, m: usize) -> Rc<dyn CostFunction> {
        Rc::new(
            QuadraticCost::lqr(
                DMatrix::identity(n, n),
                DMatrix::identity(m, m),
                &DVector::zeros(n),
                &DVector::zeros(m),
                false,
            )
            .unwrap(),
        )
    }

    #[test]
    fn equality_term_reduces_to_multiplier_plus_penalty() {
        let goal = Rc::new(GoalConstraint::new(DVector::from_vec(vec![1.0, -1.0])));
        let cv = Rc::new(RefCell::new(ConstraintValues::new(goal, 0, 2, 1, 4.0)));
        cv.borrow_mut().lambda = DVector::from_vec(vec![0.5, -2.0]);

        let al = AlCost {
            cost: quadratic(2, 1),
            values: vec![cv.clone()],
        };
        let x = DVector::from_vec(vec![2.0, 0.5]);
        let u = DVector::from_vec(vec![0.3]);

        let base = quadratic(2, 1).evaluate(&x, &u);
        // c = x - xf = (1.0, 1.5)
        let c = DVector::from_vec(vec![1.0, 1.5]);
        let lambda = DVector::from_vec(vec![0.5, -2.0]);
        let expected = base + lambda.dot(&c) + 2.0 * c.norm_squared();
        assert!((al.evaluate(&x, &u) - expected).abs() < 1e-12);
    }

    #[test]
    fn inactive_inequality_with_zero_multiplier_adds_nothing() {
        let bound = Rc::new(ControlBound::new(vec![-1.0], vec![1.0]).unwrap());
        let cv = Rc::new(RefCell::new(ConstraintValues::new(bound, 0, 2, 1, 10.0)));
        let al = AlCost {
            cost: quadratic(2, 1),
            values: vec![cv],
        };
        let x = DVector::from_vec(vec![0.2, -0.4]);
        let u = DVector::from_vec(vec![0.5]);
        assert!((al.evaluate(&x, &u) - quadratic(2, 1).evaluate(&x, &u)).abs() < 1e-12);
    }

    #[test]
    fn violated_inequality_is_penalized() {
        let bound = Rc::new(ControlBound::new(vec![-1.0], vec![1.0]).unwrap());
        let cv = Rc::new(RefCell::new(ConstraintValues::new(bound, 0, 2, 1, 10.0)));
        let al = AlCost {
            cost: quadratic(2, 1),
            values: vec![cv],
        };
        let x = DVector::zeros(2);
        let u = DVector::from_vec(vec![1.5]);
        // only the upper row is active: c = u - ub = 0.5
        let expected = quadratic(2, 1).evaluate(&x, &u) + 0.5 * 10.0 * 0.25;
        assert!((al.evaluate(&x, &u) - expected).abs() < 1e-12);
    }

    #[test]
    fn al_gradient_matches_finite_difference() {
        let goal = Rc::new(GoalConstraint::new(DVector::from_vec(vec![0.5, 0.0])));
        let bound = Rc::new(ControlBound::new(vec![-0.2], vec![0.2]).unwrap());
        let cv_goal = Rc::new(RefCell::new(ConstraintValues::new(goal, 0, 2, 1, 3.0)));
        let cv_bound = Rc::new(RefCell::new(ConstraintValues::new(bound, 0, 2, 1, 7.0)));
        cv_goal.borrow_mut().lambda = DVector::from_vec(vec![0.4, -0.9]);
        cv_bound.borrow_mut().lambda = DVector::from_vec(vec![0.3, 0.1]);

        let al = AlCost {
            cost: quadratic(2, 1),
            values: vec![cv_goal, cv_bound],
        };
        // u chosen strictly inside/outside each bound row so the active set
        // is stable under the finite-difference step
        let x = DVector::from_vec(vec![1.1, -0.7]);
        let u = DVector::from_vec(vec![0.35]);

        let mut dx = DVector::zeros(2);
        let mut du = DVector::zeros(1);
        al.gradient(&x, &u, &mut dx, &mut du);

        let eps = 1e-7;
        for i in 0..2 {
            let mut xp = x.clone();
            xp[i] += eps;
            let mut xm = x.clone();
            xm[i] -= eps;
            let fd = (al.evaluate(&xp, &u) - al.evaluate(&xm, &u)) / (2.0 * eps);
            assert!((dx[i] - fd).abs() < 1e-5, "dx[{i}] = {} vs {}", dx[i], fd);
        }
        let mut up = u.clone();
        up[0] += eps;
        let mut um = u.clone();
        um[0] -= eps;
        let fd = (al.evaluate(&x, &up) - al.evaluate(&x, &um)) / (2.0 * eps);
        assert!((du[0] - fd).abs() < 1e-5);
    }

    #[test]
    fn dual_update_keeps_inequality_multipliers_nonnegative() {
        let bound = Rc::new(ControlBound::new(vec![-1.0], vec![1.0]).unwrap());
        let mut cv = ConstraintValues::new(bound, 0, 2, 1, 2.0);
        cv.lambda = DVector::from_vec(vec![0.5, 0.5]);
        // far inside the bounds: c is very negative, the raw update would
        // go negative
        let x = DVector::zeros(2);
        let u = DVector::zeros(1);
        cv.update(&x, &u);
        cv.dual_update();
        assert!(cv.lambda.iter().all(|&l| l >= 0.0));
    }

    #[test]
    fn equality_dual_update_is_unprojected() {
        let goal = Rc::new(GoalConstraint::new(DVector::zeros(1)));
        let mut cv = ConstraintValues::new(goal, 0, 1, 1, 2.0);
        cv.lambda = DVector::from_vec(vec![1.0]);
        let x = DVector::from_vec(vec![-3.0]);
        let u = DVector::zeros(1);
        cv.update(&x, &u);
        cv.dual_update();
        // lambda + mu c = 1 - 6
        assert!((cv.lambda[0] + 5.0).abs() < 1e-12);
    }
}
