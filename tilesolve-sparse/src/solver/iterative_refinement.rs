use tilesolve_kerpiler::{Runtime, Tensor};

use super::{check_operands, host_norm, report_iteration, IterativeRefinementConfig, Solver, SolverStats};
use crate::{error::Result, matrix::Matrix};

/// Mixed precision iterative refinement.
///
/// The solution is accumulated in the extended precision type while the
/// inner solver works on corrections in the type of `x`. Residuals are
/// computed in extended precision and stored in the working one.
pub struct IterativeRefinement<'a> {
    a: &'a Matrix,
    config: IterativeRefinementConfig,
    inner: Box<dyn Solver + 'a>,
}

impl<'a> IterativeRefinement<'a> {
    pub fn new(a: &'a Matrix, config: IterativeRefinementConfig, inner: Box<dyn Solver + 'a>) -> Self {
        Self { a, config, inner }
    }

    pub fn config(&self) -> &IterativeRefinementConfig { &self.config }
    pub fn inner(&self) -> &dyn Solver { self.inner.as_ref() }
}

impl Solver for IterativeRefinement<'_> {
    #[tracing::instrument(skip_all, fields(solver = "IterativeRefinement"))]
    fn solve(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<SolverStats> {
        let (a, c) = (self.a, &self.config);
        check_operands(a, "IterativeRefinement", x, b)?;
        let working = x.ty();
        let extended = c.extended_precision_type.unwrap_or(working);
        tracing::debug!(%working, %extended, inner = %self.inner.name(), "mixed precision refinement");

        let mut stats = SolverStats::new(self.name(), c.norm, a.num_tiles());
        if SolverStats::requires_b_norm(c.rel_tolerance) {
            stats.b_norm = Some(host_norm(a, rt, c.norm, b)?);
        }
        let mut residual = a.residual_with_precision(rt, x, b, working, extended)?;
        stats.initial_residual = host_norm(a, rt, c.norm, &residual)?;
        stats.final_residual = stats.initial_residual;

        let phi = x.expr().cast(extended).materialize(rt)?;
        // x holds the correction from here on
        while !((stats.converged && stats.iterations >= c.min_iterations) || stats.iterations >= c.max_iterations) {
            stats.iterations += 1;
            if self.inner.uses_initial_guess() {
                x.fill(rt, 0.0)?;
            }
            let inner = self.inner.solve(rt, x, &residual)?;
            tracing::trace!(%inner, "correction");
            phi.assign(rt, (&phi + x.expr().cast(extended))?)?;

            residual = a.residual_with_precision(rt, &phi, b, working, extended)?;
            stats.final_residual = host_norm(a, rt, c.norm, &residual)?;
            stats.check_convergence(c.abs_tolerance, c.rel_tolerance, c.rel_residual)?;
            report_iteration(&stats, c.print_performance_each_iteration);
        }
        x.assign(rt, phi.expr().cast(working))?;

        if c.print_performance_after_solve {
            stats.print();
        }
        Ok(stats)
    }

    fn name(&self) -> String { "IterativeRefinement".into() }
    fn uses_initial_guess(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use tilesolve_kerpiler::Type;

    use super::*;
    use crate::solver::{create_solver, tests::Problem, SolverConfig};

    #[test]
    fn refines_single_precision_in_double() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(4, 3, 3, 3);
        let (a, x, b) = problem.device(&rt, Type::Float32);
        let config = SolverConfig::from_json(
            r#"{
                "type": "IterativeRefinement",
                "extendedPrecisionType": "float64",
                "absTolerance": 1e-6,
                "maxIterations": 20,
                "innerSolver": {"type": "PBiCGStab", "maxIterations": 10, "preconditioner": {"type": "ILU"}}
            }"#,
        )
        .unwrap();
        let solver = create_solver(&a, &config).unwrap();
        let stats = solver.solve(&rt, &x, &b).unwrap();
        assert!(stats.converged, "{stats}");
        assert!(stats.iterations >= 1 && stats.iterations < 20);
        assert!(stats.final_residual < 1e-6);
        assert_eq!(x.ty(), Type::Float32);
        assert!(problem.max_error(&a, &rt, &x) < 1e-5);
    }

    #[test]
    fn stationary_inner_solver_in_working_precision() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(3, 3, 3, 2);
        let (a, x, b) = problem.device(&rt, Type::Float64);
        let inner = create_solver(&a, &SolverConfig::from_json(r#"{"type": "GaussSeidel", "numFixedIterations": 3}"#).unwrap()).unwrap();
        let config = IterativeRefinementConfig { rel_tolerance: 1e-9, max_iterations: 300, ..Default::default() };
        let solver = IterativeRefinement::new(&a, config, inner);
        assert_eq!(solver.inner().name(), "GaussSeidel");
        let stats = solver.solve(&rt, &x, &b).unwrap();
        assert!(stats.converged, "{stats}");
        assert!(stats.b_norm.is_some());
        assert!(stats.final_residual < stats.initial_residual * 1e-6);
        assert!(problem.max_error(&a, &rt, &x) < 1e-7);
    }
}
