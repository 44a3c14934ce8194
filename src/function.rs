use nalgebra::{DMatrix, DVector};

/// Shared contract for any `(x, u) -> R^p` map with an analytic Jacobian.
///
/// Dynamics and constraints both speak this interface; costs are
/// scalar-valued and have their own trait. Outputs are written into
/// caller-allocated buffers so the solver hot loop never allocates.
///
/// First derivatives are mandatory and must be supplied analytically; they
/// can be verified against a finite difference with [`check_jacobian`].
/// Second-order terms are optional and gated behind [`has_hessian`].
///
/// [`has_hessian`]: VectorFunction::has_hessian
pub trait VectorFunction {
    /// Length of the output vector.
    fn output_dimension(&self) -> usize;

    /// Evaluate the function into `out`.
    ///
    /// Panics if `out` does not match the declared output dimension.
    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DVector<f64>);

    /// Evaluate the Jacobian `d/d[x, u]` into `out`, sized `p x (n + m)`.
    fn jacobian(&self, x: &DVector<f64>, u: &DVector<f64>, out: &mut DMatrix<f64>);

    /// Jacobian-transpose-vector second derivative `d/d[x,u] (J^T b)`, for
    /// functions that provide one.
    fn hessian(
        &self,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
        _b: &DVector<f64>,
        _out: &mut DMatrix<f64>,
    ) {
        panic!("this function does not provide second-order terms");
    }

    fn has_hessian(&self) -> bool {
        false
    }
}

/// Compare the analytic Jacobian of `fun` at `(x, u)` against a central
/// finite-difference estimate with step `eps`.
///
/// Returns the max-norm of the difference. Input dimensions are taken from
/// `x` and `u`.
pub fn check_jacobian(
    fun: &dyn VectorFunction,
    x: &DVector<f64>,
    u: &DVector<f64>,
    eps: f64,
) -> f64 {
    let n = x.len();
    let m = u.len();
    let p = fun.output_dimension();

    let mut jac = DMatrix::zeros(p, n + m);
    fun.jacobian(x, u, &mut jac);

    let mut fd = DMatrix::zeros(p, n + m);
    let mut hi = DVector::zeros(p);
    let mut lo = DVector::zeros(p);

    let mut xp = x.clone();
    for j in 0..n {
        xp[j] = x[j] + eps;
        fun.evaluate(&xp, u, &mut hi);
        xp[j] = x[j] - eps;
        fun.evaluate(&xp, u, &mut lo);
        xp[j] = x[j];
        fd.set_column(j, &((&hi - &lo) / (2.0 * eps)));
    }
    let mut up = u.clone();
    for j in 0..m {
        up[j] = u[j] + eps;
        fun.evaluate(x, &up, &mut hi);
        up[j] = u[j] - eps;
        fun.evaluate(x, &up, &mut lo);
        up[j] = u[j];
        fd.set_column(n + j, &((&hi - &lo) / (2.0 * eps)));
    }

    (jac - fd).amax()
}
