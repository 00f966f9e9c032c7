use tilesolve_kerpiler::{Runtime, Tensor};

use super::{Solver, SolverStats};
use crate::error::Result;

/// Runs the inner solver again, continuing from its last `x`, until it
/// reports convergence or `max_restarts` runs are used up. The stats of
/// the last run are returned.
pub struct Restarter<'a> {
    max_restarts: usize,
    inner: Box<dyn Solver + 'a>,
}

impl<'a> Restarter<'a> {
    pub fn new(max_restarts: usize, inner: Box<dyn Solver + 'a>) -> Self { Self { max_restarts, inner } }
}

impl Solver for Restarter<'_> {
    #[tracing::instrument(skip_all, fields(solver = %self.name(), max_restarts = self.max_restarts))]
    fn solve(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<SolverStats> {
        let mut runs = 1;
        let mut stats = self.inner.solve(rt, x, b)?;
        while runs < self.max_restarts && !stats.converged {
            runs += 1;
            tracing::debug!(run = runs, residual = stats.final_residual, "restarting");
            stats = self.inner.solve(rt, x, b)?;
        }
        Ok(stats)
    }

    fn name(&self) -> String { format!("Restarter of {}", self.inner.name()) }
    fn uses_initial_guess(&self) -> bool { self.inner.uses_initial_guess() }
}

#[cfg(test)]
mod tests {
    use tilesolve_kerpiler::Type;

    use super::*;
    use crate::solver::{create_solver, tests::Problem, SolverConfig};

    #[test]
    fn restarts_until_converged() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(4, 3, 2, 2);
        let inner = r#"{"type": "GaussSeidel", "absTolerance": 1e-7, "maxIterations": 10}"#;
        let config = |restarts: usize| format!(r#"{{"type": "restarter", "maxRestarts": {restarts}, "innerSolver": {inner}}}"#);

        let (a, x, b) = problem.device(&rt, Type::Float64);
        let once = create_solver(&a, &SolverConfig::from_json(&config(1)).unwrap()).unwrap();
        assert_eq!(once.name(), "Restarter of GaussSeidel");
        assert!(once.uses_initial_guess());
        let stats = once.solve(&rt, &x, &b).unwrap();
        assert!(!stats.converged);
        assert_eq!(stats.iterations, 10);

        let (a, x, b) = problem.device(&rt, Type::Float64);
        let many = create_solver(&a, &SolverConfig::from_json(&config(100)).unwrap()).unwrap();
        let stats = many.solve(&rt, &x, &b).unwrap();
        assert!(stats.converged, "{stats}");
        assert!(stats.final_residual < 1e-7);
        assert!(problem.max_error(&a, &rt, &x) < 1e-6);
    }
}
