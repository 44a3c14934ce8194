use nalgebra::{DMatrix, DVector};

use crate::problem::ProblemError;

/// Stage or terminal cost `l(x, u)` with analytic first and second
/// derivatives.
///
/// Terminal costs are evaluated with the (unused) terminal control and must
/// report [`is_terminal`]; their control derivatives are ignored by the
/// solver.
///
/// [`is_terminal`]: CostFunction::is_terminal
pub trait CostFunction {
    fn state_dimension(&self) -> usize;
    fn control_dimension(&self) -> usize;

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>) -> f64;

    /// Gradient `(dl/dx, dl/du)` written into `dx` and `du`.
    fn gradient(&self, x: &DVector<f64>, u: &DVector<f64>, dx: &mut DVector<f64>, du: &mut DVector<f64>);

    /// Hessian blocks `(d2l/dx2, d2l/du2, d2l/dxdu)` written into `dxdx`
    /// (n x n), `dudu` (m x m) and `dxdu` (n x m).
    fn hessian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        dxdx: &mut DMatrix<f64>,
        dudu: &mut DMatrix<f64>,
        dxdu: &mut DMatrix<f64>,
    );

    /// True if the cost is exactly quadratic (constant Hessian).
    fn is_quadratic(&self) -> bool {
        false
    }

    /// True if the cross term `d2l/dxdu` is identically zero.
    fn is_block_diagonal(&self) -> bool {
        false
    }

    fn is_terminal(&self) -> bool {
        false
    }
}

/// Quadratic cost `1/2 x'Qx + 1/2 u'Ru + x'Hu + q'x + r'u + c`.
#[derive(Clone, Debug)]
pub struct QuadraticCost {
    q_mat: DMatrix<f64>,
    r_mat: DMatrix<f64>,
    h_mat: DMatrix<f64>,
    q: DVector<f64>,
    r: DVector<f64>,
    c: f64,
    terminal: bool,
    block_diagonal: bool,
}

impl QuadraticCost {
    pub fn new(
        q_mat: DMatrix<f64>,
        r_mat: DMatrix<f64>,
        h_mat: DMatrix<f64>,
        q: DVector<f64>,
        r: DVector<f64>,
        c: f64,
        terminal: bool,
    ) -> Result<Self, ProblemError> {
        let n = q.len();
        let m = r.len();
        if q_mat.nrows() != n || q_mat.ncols() != n {
            return Err(ProblemError::DimensionMismatch {
                expected: n,
                got: q_mat.nrows(),
            });
        }
        if r_mat.nrows() != m || r_mat.ncols() != m {
            return Err(ProblemError::DimensionMismatch {
                expected: m,
                got: r_mat.nrows(),
            });
        }
        if h_mat.nrows() != n || h_mat.ncols() != m {
            return Err(ProblemError::DimensionMismatch {
                expected: n * m,
                got: h_mat.nrows() * h_mat.ncols(),
            });
        }
        if !is_symmetric(&q_mat) {
            return Err(ProblemError::NotSymmetric { name: "Q" });
        }
        if !is_symmetric(&r_mat) {
            return Err(ProblemError::NotSymmetric { name: "R" });
        }
        let block_diagonal = h_mat.iter().all(|&v| v == 0.0);
        Ok(Self {
            q_mat,
            r_mat,
            h_mat,
            q,
            r,
            c,
            terminal,
            block_diagonal,
        })
    }

    /// Tracking cost `1/2 (x - xref)'Q(x - xref) + 1/2 (u - uref)'R(u - uref)`
    /// in expanded form.
    pub fn lqr(
        q_mat: DMatrix<f64>,
        r_mat: DMatrix<f64>,
        xref: &DVector<f64>,
        uref: &DVector<f64>,
        terminal: bool,
    ) -> Result<Self, ProblemError> {
        let n = xref.len();
        let m = uref.len();
        if q_mat.nrows() != n || q_mat.ncols() != n {
            return Err(ProblemError::DimensionMismatch {
                expected: n,
                got: q_mat.nrows(),
            });
        }
        if r_mat.nrows() != m || r_mat.ncols() != m {
            return Err(ProblemError::DimensionMismatch {
                expected: m,
                got: r_mat.nrows(),
            });
        }
        let q = -(&q_mat * xref);
        let r = -(&r_mat * uref);
        let c = 0.5 * xref.dot(&(&q_mat * xref)) + 0.5 * uref.dot(&(&r_mat * uref));
        Self::new(q_mat, r_mat, DMatrix::zeros(n, m), q, r, c, terminal)
    }
}

/// `a' M b` without temporaries; evaluation runs inside the rollout loop.
fn quad_form(mat: &DMatrix<f64>, a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    let mut acc = 0.0;
    for j in 0..mat.ncols() {
        let mut col = 0.0;
        for i in 0..mat.nrows() {
            col += a[i] * mat[(i, j)];
        }
        acc += col * b[j];
    }
    acc
}

fn is_symmetric(mat: &DMatrix<f64>) -> bool {
    for i in 0..mat.nrows() {
        for j in (i + 1)..mat.ncols() {
            if (mat[(i, j)] - mat[(j, i)]).abs() > 1e-10 {
                return false;
            }
        }
    }
    true
}

impl CostFunction for QuadraticCost {
    fn state_dimension(&self) -> usize {
        self.q.len()
    }

    fn control_dimension(&self) -> usize {
        self.r.len()
    }

    fn evaluate(&self, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        let mut cost = self.c + self.q.dot(x) + self.r.dot(u);
        cost += 0.5 * quad_form(&self.q_mat, x, x);
        cost += 0.5 * quad_form(&self.r_mat, u, u);
        cost += quad_form(&self.h_mat, x, u);
        cost
    }

    fn gradient(&self, x: &DVector<f64>, u: &DVector<f64>, dx: &mut DVector<f64>, du: &mut DVector<f64>) {
        dx.copy_from(&self.q);
        dx.gemv(1.0, &self.q_mat, x, 1.0);
        dx.gemv(1.0, &self.h_mat, u, 1.0);

        du.copy_from(&self.r);
        du.gemv(1.0, &self.r_mat, u, 1.0);
        du.gemv_tr(1.0, &self.h_mat, x, 1.0);
    }

    fn hessian(
        &self,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
        dxdx: &mut DMatrix<f64>,
        dudu: &mut DMatrix<f64>,
        dxdu: &mut DMatrix<f64>,
    ) {
        dxdx.copy_from(&self.q_mat);
        dudu.copy_from(&self.r_mat);
        dxdu.copy_from(&self.h_mat);
    }

    fn is_quadratic(&self) -> bool {
        true
    }

    fn is_block_diagonal(&self) -> bool {
        self.block_diagonal
    }

    fn is_terminal(&self) -> bool {
        self.terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cost_fixture() -> QuadraticCost {
        let q_mat = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 3.0]);
        let r_mat = DMatrix::from_row_slice(1, 1, &[0.1]);
        let h_mat = DMatrix::from_row_slice(2, 1, &[0.2, -0.3]);
        let q = DVector::from_vec(vec![1.0, -1.0]);
        let r = DVector::from_vec(vec![0.5]);
        QuadraticCost::new(q_mat, r_mat, h_mat, q, r, 4.0, false).unwrap()
    }

    #[test]
    fn evaluates_expanded_form() {
        let cost = cost_fixture();
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let u = DVector::from_vec(vec![3.0]);
        // 1/2 x'Qx = 8.0, 1/2 u'Ru = 0.45, x'Hu = -1.2, q'x = -1, r'u = 1.5
        let expected = 8.0 + 0.45 - 1.2 - 1.0 + 1.5 + 4.0;
        assert!((cost.evaluate(&x, &u) - expected).abs() < 1e-12);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let cost = cost_fixture();
        let x = DVector::from_vec(vec![0.3, -0.8]);
        let u = DVector::from_vec(vec![1.7]);
        let mut dx = DVector::zeros(2);
        let mut du = DVector::zeros(1);
        cost.gradient(&x, &u, &mut dx, &mut du);

        let eps = 1e-6;
        for i in 0..2 {
            let mut xp = x.clone();
            xp[i] += eps;
            let mut xm = x.clone();
            xm[i] -= eps;
            let fd = (cost.evaluate(&xp, &u) - cost.evaluate(&xm, &u)) / (2.0 * eps);
            assert!((dx[i] - fd).abs() < 1e-6);
        }
        let mut up = u.clone();
        up[0] += eps;
        let mut um = u.clone();
        um[0] -= eps;
        let fd = (cost.evaluate(&x, &up) - cost.evaluate(&x, &um)) / (2.0 * eps);
        assert!((du[0] - fd).abs() < 1e-6);
    }

    #[test]
    fn lqr_form_is_zero_at_the_reference() {
        let q_mat = DMatrix::identity(3, 3) * 2.0;
        let r_mat = DMatrix::identity(2, 2) * 0.5;
        let xref = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let uref = DVector::from_vec(vec![0.1, 0.2]);
        let cost = QuadraticCost::lqr(q_mat, r_mat, &xref, &uref, false).unwrap();
        assert!(cost.evaluate(&xref, &uref).abs() < 1e-12);
        assert!(cost.is_quadratic());
        assert!(cost.is_block_diagonal());
    }

    #[test]
    fn asymmetric_weight_is_rejected() {
        let q_mat = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        let err = QuadraticCost::new(
            q_mat,
            DMatrix::identity(1, 1),
            DMatrix::zeros(2, 1),
            DVector::zeros(2),
            DVector::zeros(1),
            0.0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ProblemError::NotSymmetric { name: "Q" }));
    }
}
