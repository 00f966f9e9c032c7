//! Sparse linear systems on tile-distributed accelerators.
//!
//! A host matrix in coordinate form is converted to CRS, its rows are
//! partitioned over tiles and every tile gets a local addressing with
//! halo rows borrowed from its neighbours. The device [`Matrix`] built
//! from that decomposition drives the iterative solvers in [`solver`].
//!
//! ```no_run
//! use tilesolve_kerpiler::{Runtime, Type};
//! use tilesolve_sparse::{
//!     host::{poisson_3d, HostMatrix},
//!     partition::RecursiveBisection,
//!     solver::{create_solver, SolverConfig},
//!     Matrix,
//! };
//!
//! # fn main() -> tilesolve_sparse::Result<()> {
//! let rt = Runtime::with_cache_dir("/tmp/tilesolve")?;
//! let host = HostMatrix::new(poisson_3d(8, 8, 8).into_crs()?, 16, &RecursiveBisection::default())?;
//! let a = Matrix::new(&rt, &host, Type::Float32)?;
//! let x = a.load_vector(&rt, &vec![0.0; host.num_rows()], true)?;
//! let b = a.load_vector(&rt, &vec![1.0; host.num_rows()], false)?;
//! let config = SolverConfig::from_json(r#"{"type": "PBiCGStab", "maxIterations": 50, "absTolerance": 1e-5}"#)?;
//! let stats = create_solver(&a, &config)?.solve(&rt, &x, &b)?;
//! println!("{stats}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod host;
pub mod layout;
pub mod matrix;
pub mod partition;
pub mod solver;

pub use error::{Error, Result};
pub use host::{CrsMatrix, HostMatrix, TripletMatrix};
pub use layout::{DistributedTileLayout, TilePartition};
pub use matrix::Matrix;
pub use partition::{GraphPartitioner, Partitioning, RecursiveBisection};
pub use solver::{Solver, SolverConfig, SolverStats, VectorNorm};
