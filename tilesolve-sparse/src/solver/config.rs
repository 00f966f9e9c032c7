use serde::{Deserialize, Serialize};
use tilesolve_kerpiler::Type;

use super::{MultiColorMode, VectorNorm};
use crate::error::Result;

// JSON integers, "unbounded" by default
const UNLIMITED: usize = i32::MAX as usize;

/// Solver selection and parameters, tagged by `"type"`.
///
/// ```
/// # use tilesolve_sparse::solver::SolverConfig;
/// let config = SolverConfig::from_json(
///     r#"{"type": "PBiCGStab", "maxIterations": 20, "preconditioner": {"type": "ILU"}}"#,
/// ).unwrap();
/// assert_eq!(config.name(), "PBiCGStab(DILU)");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SolverConfig {
    GaussSeidel(GaussSeidelConfig),
    #[serde(rename = "ILU")]
    Ilu(IluConfig),
    PBiCGStab(PBiCGStabConfig),
    IterativeRefinement(IterativeRefinementConfig),
    #[serde(rename = "restarter")]
    Restarter(RestarterConfig),
}

impl SolverConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn name(&self) -> String {
        match self {
            SolverConfig::GaussSeidel(_) => "GaussSeidel".into(),
            SolverConfig::Ilu(c) => c.name().into(),
            SolverConfig::PBiCGStab(c) => match &c.preconditioner {
                Some(p) => format!("PBiCGStab({})", p.name()),
                None => "BiCGStab".into(),
            },
            SolverConfig::IterativeRefinement(_) => "IterativeRefinement".into(),
            SolverConfig::Restarter(c) => match &c.inner_solver {
                Some(inner) => format!("Restarter of {}", inner.name()),
                None => "Restarter".into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GaussSeidelConfig {
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub rel_residual: f64,
    pub max_iterations: usize,
    pub min_iterations: usize,
    // sweeps between two convergence checks
    pub num_sweeps: usize,
    // when non-zero, sweep this often and skip every convergence check
    pub num_fixed_iterations: usize,
    pub solve_multicolor: MultiColorMode,
    pub print_performance_after_solve: bool,
    pub print_performance_each_iteration: bool,
    pub norm: VectorNorm,
    // row accumulation type, the type of x when unset
    pub working_type: Option<Type>,
}

impl Default for GaussSeidelConfig {
    fn default() -> Self {
        Self {
            abs_tolerance: 0.0,
            rel_tolerance: 0.0,
            rel_residual: 0.0,
            max_iterations: UNLIMITED,
            min_iterations: 0,
            num_sweeps: 1,
            num_fixed_iterations: 0,
            solve_multicolor: MultiColorMode::Auto,
            print_performance_after_solve: false,
            print_performance_each_iteration: false,
            norm: VectorNorm::L2,
            working_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IluConfig {
    pub solve_multicolor: MultiColorMode,
    pub factorize_multicolor: MultiColorMode,
    // DILU keeps the off-diagonal entries and only modifies the diagonal
    pub diagonal_based: bool,
}

impl Default for IluConfig {
    fn default() -> Self {
        Self { solve_multicolor: MultiColorMode::Auto, factorize_multicolor: MultiColorMode::Auto, diagonal_based: true }
    }
}

impl IluConfig {
    pub fn name(&self) -> &'static str {
        if self.diagonal_based { "DILU" } else { "ILU(0)" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PBiCGStabConfig {
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub rel_residual: f64,
    pub max_iterations: usize,
    pub min_iterations: usize,
    pub print_performance_after_solve: bool,
    pub print_performance_each_iteration: bool,
    pub verbose: bool,
    pub norm: VectorNorm,
    // type of the search vectors, the type of x when unset
    pub working_type: Option<Type>,
    pub preconditioner: Option<Box<SolverConfig>>,
}

impl Default for PBiCGStabConfig {
    fn default() -> Self {
        Self {
            abs_tolerance: 0.0,
            rel_tolerance: 0.0,
            rel_residual: 0.0,
            max_iterations: UNLIMITED,
            min_iterations: 0,
            print_performance_after_solve: false,
            print_performance_each_iteration: false,
            verbose: false,
            norm: VectorNorm::L2,
            working_type: None,
            preconditioner: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IterativeRefinementConfig {
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    pub rel_residual: f64,
    pub max_iterations: usize,
    pub min_iterations: usize,
    pub print_performance_after_solve: bool,
    pub print_performance_each_iteration: bool,
    pub norm: VectorNorm,
    // the solution is accumulated in this type, the type of x when unset
    pub extended_precision_type: Option<Type>,
    pub inner_solver: Option<Box<SolverConfig>>,
}

impl Default for IterativeRefinementConfig {
    fn default() -> Self {
        Self {
            abs_tolerance: 0.0,
            rel_tolerance: 0.0,
            rel_residual: 0.0,
            max_iterations: UNLIMITED,
            min_iterations: 0,
            print_performance_after_solve: false,
            print_performance_each_iteration: false,
            norm: VectorNorm::L2,
            extended_precision_type: None,
            inner_solver: None,
        }
    }
}

/// Reruns the inner solver until it converges, at most `max_restarts`
/// times in total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestarterConfig {
    pub max_restarts: usize,
    pub inner_solver: Option<Box<SolverConfig>>,
}

impl Default for RestarterConfig {
    fn default() -> Self { Self { max_restarts: 1, inner_solver: None } }
}
