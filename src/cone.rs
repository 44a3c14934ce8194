use nalgebra::{DMatrix, DVector};

/// Convex cones recognized by the solver.
///
/// A constraint `g(x, u) in K` carries one of these tags. The augmented
/// Lagrangian machinery projects multiplier estimates onto the dual cone, so
/// duality is part of the contract: `Zero` and `Identity` are duals of each
/// other and the negative orthant is self-dual.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cone {
    /// The origin. Membership means equality: `g(x, u) = 0`.
    Zero,
    /// The whole space. Dual of `Zero`; never used to tag a constraint
    /// directly.
    Identity,
    /// Componentwise `g(x, u) <= 0`.
    NegativeOrthant,
}

impl Cone {
    pub fn dual(self) -> Cone {
        match self {
            Cone::Zero => Cone::Identity,
            Cone::Identity => Cone::Zero,
            Cone::NegativeOrthant => Cone::NegativeOrthant,
        }
    }

    /// Euclidean projection of `v` onto the cone.
    pub fn project(self, v: &DVector<f64>, out: &mut DVector<f64>) {
        assert_eq!(
            v.len(),
            out.len(),
            "projection input and output must be the same size"
        );
        match self {
            Cone::Zero => out.fill(0.0),
            Cone::Identity => out.copy_from(v),
            Cone::NegativeOrthant => {
                for i in 0..v.len() {
                    out[i] = v[i].min(0.0);
                }
            }
        }
    }

    /// Jacobian of the projection at `v`, written into the square matrix
    /// `out`.
    pub fn projection_jacobian(self, v: &DVector<f64>, out: &mut DMatrix<f64>) {
        assert_eq!(out.nrows(), out.ncols(), "projection Jacobian is square");
        assert_eq!(v.len(), out.nrows(), "Jacobian size must match the input");
        out.fill(0.0);
        match self {
            Cone::Zero => {}
            Cone::Identity => out.fill_diagonal(1.0),
            Cone::NegativeOrthant => {
                for i in 0..v.len() {
                    out[(i, i)] = if v[i] > 0.0 { 0.0 } else { 1.0 };
                }
            }
        }
    }

    /// Second derivative of `b^T project(v)` at `v`.
    ///
    /// All three projections are piecewise linear, so this is identically
    /// zero; it exists so conic constraints slot into second-order
    /// expansions uniformly.
    pub fn projection_hessian(self, v: &DVector<f64>, b: &DVector<f64>, out: &mut DMatrix<f64>) {
        assert_eq!(out.nrows(), out.ncols(), "projection Hessian is square");
        assert_eq!(v.len(), b.len(), "v and b must be the same size");
        out.fill(0.0);
    }
}
