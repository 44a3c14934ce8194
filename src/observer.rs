use crate::trajectory::Trajectory;

/// One unit of solver progress, reported at iteration boundaries.
pub enum SolverStep<'a> {
    /// An accepted inner (iLQR) iteration.
    Inner {
        iteration: usize,
        cost: f64,
        cost_decrease: f64,
        gradient: f64,
        alpha: f64,
        rho: f64,
        trajectory: &'a Trajectory,
    },
    /// A completed augmented Lagrangian outer iteration, after the dual
    /// update.
    Outer {
        iteration: usize,
        violation: f64,
        max_penalty: f64,
    },
}

/// Callback interface for watching (and cancelling) a solve.
///
/// `abort_requested` is polled at iteration boundaries; returning `true`
/// stops the solver with `UserAborted` and the best trajectory seen so far
/// intact.
pub trait SolverObserver {
    fn on_step(&mut self, step: SolverStep<'_>);

    fn abort_requested(&mut self) -> bool {
        false
    }
}

impl SolverObserver for () {
    fn on_step(&mut self, _: SolverStep<'_>) {}
}

#[derive(Clone, Debug, PartialEq)]
pub struct InnerRecord {
    pub iteration: usize,
    pub cost: f64,
    pub cost_decrease: f64,
    pub gradient: f64,
    pub alpha: f64,
    pub rho: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OuterRecord {
    pub iteration: usize,
    pub violation: f64,
    pub max_penalty: f64,
}

/// Records every reported step. Useful for tests and offline inspection.
#[derive(Debug, Default)]
pub struct IterationRecorder {
    pub inner: Vec<InnerRecord>,
    pub outer: Vec<OuterRecord>,
}

impl SolverObserver for IterationRecorder {
    fn on_step(&mut self, step: SolverStep<'_>) {
        match step {
            SolverStep::Inner {
                iteration,
                cost,
                cost_decrease,
                gradient,
                alpha,
                rho,
                trajectory: _,
            } => self.inner.push(InnerRecord {
                iteration,
                cost,
                cost_decrease,
                gradient,
                alpha,
                rho,
            }),
            SolverStep::Outer {
                iteration,
                violation,
                max_penalty,
            } => self.outer.push(OuterRecord {
                iteration,
                violation,
                max_penalty,
            }),
        }
    }
}

/// Aborts after a fixed number of inner iterations. Handy for exercising
/// cooperative cancellation.
#[derive(Debug)]
pub struct AbortAfter {
    remaining: usize,
}

impl AbortAfter {
    pub fn new(iterations: usize) -> Self {
        Self {
            remaining: iterations,
        }
    }
}

impl SolverObserver for AbortAfter {
    fn on_step(&mut self, step: SolverStep<'_>) {
        if matches!(step, SolverStep::Inner { .. }) {
            self.remaining = self.remaining.saturating_sub(1);
        }
    }

    fn abort_requested(&mut self) -> bool {
        self.remaining == 0
    }
}
