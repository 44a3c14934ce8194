use nalgebra::DVector;

use crate::problem::ProblemError;

/// A single `(state, control, step)` triple at discrete time `k`.
///
/// At the terminal knot the control and step are stored but unused.
#[derive(Clone, Debug, PartialEq)]
pub struct KnotPoint {
    pub x: DVector<f64>,
    pub u: DVector<f64>,
    pub h: f64,
}

impl KnotPoint {
    pub fn new(x: DVector<f64>, u: DVector<f64>, h: f64) -> Result<Self, ProblemError> {
        if h < 0.0 {
            return Err(ProblemError::NegativeStep { step: h });
        }
        Ok(Self { x, u, h })
    }
}

/// A horizon of `N + 1` knot points sharing common state and control
/// dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    knots: Vec<KnotPoint>,
    n: usize,
    m: usize,
}

impl Trajectory {
    /// A zero-initialized trajectory over `num_segments` dynamics segments.
    pub fn new(n: usize, m: usize, num_segments: usize) -> Self {
        let knots = (0..=num_segments)
            .map(|_| KnotPoint {
                x: DVector::zeros(n),
                u: DVector::zeros(m),
                h: 0.0,
            })
            .collect();
        Self { knots, n, m }
    }

    /// Build a trajectory from explicit knot points, validating that all
    /// share the same dimensions and have non-negative steps.
    pub fn from_knots(knots: Vec<KnotPoint>) -> Result<Self, ProblemError> {
        let first = knots.first().ok_or(ProblemError::EmptyTrajectory)?;
        let (n, m) = (first.x.len(), first.u.len());
        for knot in &knots {
            if knot.x.len() != n {
                return Err(ProblemError::DimensionMismatch {
                    expected: n,
                    got: knot.x.len(),
                });
            }
            if knot.u.len() != m {
                return Err(ProblemError::DimensionMismatch {
                    expected: m,
                    got: knot.u.len(),
                });
            }
            if knot.h < 0.0 {
                return Err(ProblemError::NegativeStep { step: knot.h });
            }
        }
        Ok(Self { knots, n, m })
    }

    pub fn state_dimension(&self) -> usize {
        self.n
    }

    pub fn control_dimension(&self) -> usize {
        self.m
    }

    /// Number of dynamics segments `N`; the trajectory has `N + 1` knots.
    pub fn num_segments(&self) -> usize {
        self.knots.len() - 1
    }

    pub fn knot(&self, k: usize) -> &KnotPoint {
        &self.knots[k]
    }

    pub fn state(&self, k: usize) -> &DVector<f64> {
        &self.knots[k].x
    }

    pub fn state_mut(&mut self, k: usize) -> &mut DVector<f64> {
        &mut self.knots[k].x
    }

    pub fn control(&self, k: usize) -> &DVector<f64> {
        &self.knots[k].u
    }

    pub fn control_mut(&mut self, k: usize) -> &mut DVector<f64> {
        &mut self.knots[k].u
    }

    pub fn step(&self, k: usize) -> f64 {
        self.knots[k].h
    }

    pub fn set_step(&mut self, k: usize, h: f64) -> Result<(), ProblemError> {
        if h < 0.0 {
            return Err(ProblemError::NegativeStep { step: h });
        }
        self.knots[k].h = h;
        Ok(())
    }

    /// Assign the same step to every knot.
    pub fn set_uniform_step(&mut self, h: f64) {
        assert!(h >= 0.0, "step sizes must be non-negative");
        for knot in &mut self.knots {
            knot.h = h;
        }
    }

    /// True if every state and control entry is finite.
    pub fn is_finite(&self) -> bool {
        self.knots
            .iter()
            .all(|z| z.x.iter().all(|v| v.is_finite()) && z.u.iter().all(|v| v.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_trajectory_shape() {
        let z = Trajectory::new(3, 2, 10);
        assert_eq!(z.num_segments(), 10);
        assert_eq!(z.state_dimension(), 3);
        assert_eq!(z.control_dimension(), 2);
        assert_eq!(z.state(10).len(), 3);
        assert!(z.is_finite());
    }

    #[test]
    fn uniform_step_touches_every_knot() {
        let mut z = Trajectory::new(2, 1, 5);
        z.set_uniform_step(0.1);
        for k in 0..=5 {
            assert_eq!(z.step(k), 0.1);
        }
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let knots = vec![
            KnotPoint::new(DVector::zeros(2), DVector::zeros(1), 0.1).unwrap(),
            KnotPoint::new(DVector::zeros(3), DVector::zeros(1), 0.1).unwrap(),
        ];
        let err = Trajectory::from_knots(knots).unwrap_err();
        assert!(matches!(err, ProblemError::DimensionMismatch { .. }));
    }

    #[test]
    fn negative_step_is_rejected() {
        assert!(matches!(
            KnotPoint::new(DVector::zeros(2), DVector::zeros(1), -0.5),
            Err(ProblemError::NegativeStep { .. })
        ));
        let mut z = Trajectory::new(2, 1, 3);
        assert!(z.set_step(1, -1.0).is_err());
    }
}
