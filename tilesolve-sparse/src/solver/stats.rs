use std::fmt;

use serde::Serialize;

use super::VectorNorm;
use crate::error::{Error, Result};

/// Outcome of one solve. Non-convergence and breakdown are reported here
/// rather than as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverStats {
    pub solver: String,
    pub norm: VectorNorm,
    pub num_tiles: usize,
    pub initial_residual: f64,
    pub final_residual: f64,
    pub b_norm: Option<f64>,
    pub iterations: usize,
    pub converged: bool,
    pub singular: bool,
}

impl SolverStats {
    pub fn new(solver: impl Into<String>, norm: VectorNorm, num_tiles: usize) -> Self {
        Self {
            solver: solver.into(),
            norm,
            num_tiles,
            initial_residual: 0.0,
            final_residual: 0.0,
            b_norm: None,
            iterations: 0,
            converged: false,
            singular: false,
        }
    }

    /// Only a relative tolerance needs `||b||`.
    pub fn requires_b_norm(rel_tolerance: f64) -> bool { rel_tolerance > 0.0 }

    /// Update `converged` from the final residual. A positive
    /// `rel_tolerance` compares against `||b||`, which must be known.
    pub fn check_convergence(&mut self, abs_tolerance: f64, rel_tolerance: f64, rel_residual: f64) -> Result<bool> {
        let mut converged =
            self.final_residual < abs_tolerance || self.final_residual < self.initial_residual * rel_residual;
        if rel_tolerance > 0.0 {
            let Some(b_norm) = self.b_norm else {
                return Err(Error::Solver {
                    solver: self.solver.clone(),
                    reason: "a relative tolerance needs the norm of b, which was not computed".into(),
                });
            };
            converged |= self.final_residual < b_norm * rel_tolerance;
        }
        self.converged = converged;
        Ok(converged)
    }

    /// Latch `singular` once `value` drops below `tolerance`.
    pub fn check_singularity(&mut self, value: f64, tolerance: f64) -> bool {
        // NaN compares false, a breakdown must still latch
        self.singular |= !(value >= tolerance);
        self.singular
    }

    /// Log the stats at info level.
    pub fn print(&self) {
        tracing::info!("{self}");
    }
}

impl fmt::Display for SolverStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Solved on {} tiles, {} norm, Initial residual = {}, Final residual = {}, Iterations = {}, Converged = {}, Singular = {}",
            self.solver,
            self.num_tiles,
            self.norm,
            self.initial_residual,
            self.final_residual,
            self.iterations,
            self.converged,
            self.singular
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_rules() {
        let mut s = SolverStats::new("GaussSeidel", VectorNorm::L2, 4);
        s.initial_residual = 10.0;
        s.final_residual = 0.5;
        assert!(!s.check_convergence(0.1, 0.0, 0.01).unwrap());
        assert!(s.check_convergence(1.0, 0.0, 0.0).unwrap());
        assert!(s.check_convergence(0.0, 0.0, 0.1).unwrap());
        assert!(!s.check_convergence(0.0, 0.0, 0.0).unwrap());

        assert!(matches!(s.check_convergence(0.0, 0.1, 0.0), Err(Error::Solver { .. })));
        s.b_norm = Some(20.0);
        assert!(s.check_convergence(0.0, 0.1, 0.0).unwrap());
        assert!(!s.check_convergence(0.0, 0.01, 0.0).unwrap());
        assert!(SolverStats::requires_b_norm(0.01));
        assert!(!SolverStats::requires_b_norm(0.0));
    }

    #[test]
    fn singularity_latches() {
        let mut s = SolverStats::new("BiCGStab", VectorNorm::L2, 1);
        assert!(!s.check_singularity(1.0, 1e-37));
        assert!(s.check_singularity(0.0, 1e-37));
        assert!(s.check_singularity(1.0, 1e-37));
        let mut s = SolverStats::new("BiCGStab", VectorNorm::L2, 1);
        assert!(s.check_singularity(f64::NAN, 1e-37));
    }

    #[test]
    fn display_line() {
        let mut s = SolverStats::new("ILU", VectorNorm::LInf, 3);
        s.initial_residual = 2.0;
        s.final_residual = 0.25;
        s.iterations = 1;
        assert_eq!(
            s.to_string(),
            "ILU: Solved on 3 tiles, LINF norm, Initial residual = 2, Final residual = 0.25, Iterations = 1, Converged = false, Singular = false"
        );
    }
}
