//! Iterative solvers for `A x = b` on a device [`Matrix`].
//!
//! Every solver takes `x` with halo, used as the initial guess when
//! [`Solver::uses_initial_guess`] says so and overwritten with the
//! solution, and `b` without halo. Control flow and convergence checks run
//! on the host, scalars are read back after every reduction.

mod config;
mod gauss_seidel;
mod ilu;
mod iterative_refinement;
mod pbicgstab;
mod restarter;
mod stats;

use std::fmt;

use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};
use tilesolve_kerpiler::{Runtime, Tensor};

pub use self::{
    config::{GaussSeidelConfig, IluConfig, IterativeRefinementConfig, PBiCGStabConfig, RestarterConfig, SolverConfig},
    gauss_seidel::GaussSeidel,
    ilu::Ilu,
    iterative_refinement::IterativeRefinement,
    pbicgstab::PBiCGStab,
    restarter::Restarter,
    stats::SolverStats,
};
use crate::{
    error::{Error, Result},
    matrix::Matrix,
};

#[auto_impl(&, Box, Arc)]
pub trait Solver {
    fn solve(&self, rt: &Runtime, x: &Tensor, b: &Tensor) -> Result<SolverStats>;
    fn name(&self) -> String;
    /// Whether `x` is read as the initial guess. Callers that want a zero
    /// guess must clear it themselves.
    fn uses_initial_guess(&self) -> bool;
}

/// Build the solver `config` describes, nested solvers included.
pub fn create_solver<'a>(a: &'a Matrix, config: &SolverConfig) -> Result<Box<dyn Solver + 'a>> {
    tracing::debug!(solver = %config.name(), "creating solver");
    let solver: Box<dyn Solver + 'a> = match config {
        SolverConfig::GaussSeidel(c) => Box::new(GaussSeidel::new(a, c.clone())),
        SolverConfig::Ilu(c) => Box::new(Ilu::new(a, c.clone())),
        SolverConfig::PBiCGStab(c) => {
            let preconditioner = c.preconditioner.as_deref().map(|p| create_solver(a, p)).transpose()?;
            Box::new(PBiCGStab::new(a, c.clone(), preconditioner))
        }
        SolverConfig::IterativeRefinement(c) => {
            let inner = required_inner(config, c.inner_solver.as_deref())?;
            Box::new(IterativeRefinement::new(a, c.clone(), create_solver(a, inner)?))
        }
        SolverConfig::Restarter(c) => {
            let inner = required_inner(config, c.inner_solver.as_deref())?;
            Box::new(Restarter::new(c.max_restarts, create_solver(a, inner)?))
        }
    };
    Ok(solver)
}

fn required_inner<'c>(config: &SolverConfig, inner: Option<&'c SolverConfig>) -> Result<&'c SolverConfig> {
    inner.ok_or_else(|| Error::Config(format!("{} needs an innerSolver", config.name())))
}

pub(crate) fn check_operands(a: &Matrix, solver: &str, x: &Tensor, b: &Tensor) -> Result<()> {
    let err = |reason: String| Error::Solver { solver: solver.into(), reason };
    if !a.is_vector_compatible(x, true) {
        return Err(err(format!("x must be a vector with halo cells, got {}", x.shape())));
    }
    if !a.is_vector_compatible(b, false) {
        return Err(err(format!("b must be a vector without halo cells, got {}", b.shape())));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VectorNorm {
    L1,
    #[default]
    L2,
    #[serde(rename = "LINF")]
    LInf,
    None,
}

impl fmt::Display for VectorNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VectorNorm::L1 => "L1",
            VectorNorm::L2 => "L2",
            VectorNorm::LInf => "LINF",
            VectorNorm::None => "None",
        })
    }
}

/// Whether triangular sweeps run color by color with all workers of a
/// tile, or row by row on one worker. `true`, `false` or `"auto"` in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "MultiColorRepr", into = "MultiColorRepr")]
pub enum MultiColorMode {
    On,
    Off,
    #[default]
    Auto,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MultiColorRepr {
    Flag(bool),
    Word(String),
}

impl TryFrom<MultiColorRepr> for MultiColorMode {
    type Error = String;
    fn try_from(repr: MultiColorRepr) -> std::result::Result<Self, String> {
        match repr {
            MultiColorRepr::Flag(true) => Ok(MultiColorMode::On),
            MultiColorRepr::Flag(false) => Ok(MultiColorMode::Off),
            MultiColorRepr::Word(w) if w == "auto" => Ok(MultiColorMode::Auto),
            MultiColorRepr::Word(w) => Err(format!("invalid multicolor mode {w:?}, expected true, false or \"auto\"")),
        }
    }
}

impl From<MultiColorMode> for MultiColorRepr {
    fn from(mode: MultiColorMode) -> Self {
        match mode {
            MultiColorMode::On => MultiColorRepr::Flag(true),
            MultiColorMode::Off => MultiColorRepr::Flag(false),
            MultiColorMode::Auto => MultiColorRepr::Word("auto".into()),
        }
    }
}

impl MultiColorMode {
    /// `Auto` follows the recommendation computed with the coloring.
    pub fn should_use_multicolor(self, a: &Matrix) -> bool {
        match self {
            MultiColorMode::On => true,
            MultiColorMode::Off => false,
            MultiColorMode::Auto => a.multicolor_recommended(),
        }
    }
}

// the norm of a vector, read back to the host
pub(crate) fn host_norm(a: &Matrix, rt: &Runtime, norm: VectorNorm, v: &Tensor) -> Result<f64> {
    Ok(a.vector_norm(rt, norm, v)?.to_scalar::<f64>(rt)?)
}

// log one iteration at info level if asked to, otherwise at debug
pub(crate) fn report_iteration(stats: &SolverStats, each_iteration: bool) {
    if each_iteration {
        stats.print();
    } else {
        tracing::debug!(iteration = stats.iterations, residual = stats.final_residual, "{}", stats.solver);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tilesolve_kerpiler::Type;

    use super::*;
    use crate::{
        host::{poisson_3d, HostMatrix},
        partition::RecursiveBisection,
    };

    /// A Poisson system with a known solution.
    pub(crate) struct Problem {
        pub host: HostMatrix,
        pub solution: Vec<f64>,
        pub rhs: Vec<f64>,
    }

    impl Problem {
        pub fn poisson(nx: usize, ny: usize, nz: usize, tiles: usize) -> Self {
            let crs = poisson_3d(nx, ny, nz).into_crs().unwrap();
            let host = HostMatrix::new(crs, tiles, &RecursiveBisection::default()).unwrap();
            let solution: Vec<f64> = (0..host.num_rows()).map(|i| 1.0 + (i % 5) as f64 * 0.25).collect();
            let rhs = host.crs().multiply(&solution);
            Self { host, solution, rhs }
        }

        pub fn device(&self, rt: &Runtime, ty: Type) -> (Matrix, Tensor, Tensor) {
            let a = Matrix::new(rt, &self.host, ty).unwrap();
            let x = a.load_vector(rt, &vec![0.0; self.host.num_rows()], true).unwrap();
            let b = a.load_vector(rt, &self.rhs, false).unwrap();
            (a, x, b)
        }

        pub fn max_error(&self, a: &Matrix, rt: &Runtime, x: &Tensor) -> f64 {
            let x = a.vector_to_host(rt, x).unwrap();
            x.iter().zip(&self.solution).map(|(x, s)| (x - s).abs()).fold(0.0, f64::max)
        }
    }

    #[test]
    fn multicolor_mode_from_json() {
        let mode = |s: &str| serde_json::from_str::<MultiColorMode>(s);
        assert_eq!(mode("true").unwrap(), MultiColorMode::On);
        assert_eq!(mode("false").unwrap(), MultiColorMode::Off);
        assert_eq!(mode("\"auto\"").unwrap(), MultiColorMode::Auto);
        assert!(mode("\"on\"").is_err());
        assert_eq!(serde_json::to_string(&MultiColorMode::Auto).unwrap(), "\"auto\"");
        assert_eq!(serde_json::from_str::<VectorNorm>("\"LINF\"").unwrap(), VectorNorm::LInf);
        assert_eq!(VectorNorm::L1.to_string(), "L1");
    }

    #[test]
    fn solvers_need_their_inner_solver() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::with_cache_dir(dir.path()).unwrap();
        let problem = Problem::poisson(3, 3, 2, 2);
        let (a, x, b) = problem.device(&rt, Type::Float32);
        let config = SolverConfig::from_json(r#"{"type": "IterativeRefinement"}"#).unwrap();
        assert!(matches!(create_solver(&a, &config), Err(Error::Config(_))));

        let config = SolverConfig::from_json(r#"{"type": "PBiCGStab", "preconditioner": {"type": "ILU"}}"#).unwrap();
        let solver = create_solver(&a, &config).unwrap();
        assert_eq!(solver.name(), "PBiCGStab(DILU)");
        assert!(solver.uses_initial_guess());
        // operands the other way round
        assert!(matches!(solver.solve(&rt, &b, &x), Err(Error::Solver { .. })));
    }
}
