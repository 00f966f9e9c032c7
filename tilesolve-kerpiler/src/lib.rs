//! Tensor expressions over tile-distributed accelerator memory.
//!
//! Tensors are spread over tiles along their leading dimension. Element-wise
//! expressions over them are lowered into compute kernels, which are cached
//! on disk by content and executed on the simulated device held by a
//! [`Runtime`].
//!
//! ```no_run
//! use tilesolve_kerpiler::{DistributedShape, Runtime, Tensor, TensorShape};
//!
//! # fn main() -> tilesolve_kerpiler::Result<()> {
//! let rt = Runtime::with_cache_dir("/tmp/tilesolve")?;
//! let shape = DistributedShape::linearly_distributed(TensorShape::new([4])?, 2)?;
//! let a = Tensor::from_values(&rt, shape, &[1.0f32, 2.0, 3.0, 4.0])?;
//! let b = (&a * &a)?.materialize(&rt)?;
//! assert_eq!(b.to_vec::<f32>(&rt)?, vec![1.0, 4.0, 9.0, 16.0]);
//! # Ok(())
//! # }
//! ```

pub mod codegen;
pub mod config;
pub mod error;
pub mod expr;
pub mod ops;
pub mod runtime;
pub mod shape;
pub mod tensor;
pub mod typing;

pub use config::{PrintFormat, RuntimeConfig, Topology};
pub use error::{Error, Result};
pub use expr::{Expression, IntoExpression};
pub use ops::{BinaryOp, ReduceOp, UnaryOp};
pub use runtime::{CopyBlock, HostTensor, RemoteTensor, Runtime};
pub use shape::{DistributedShape, FirstDimDistribution, Interval, TensorShape, TileMapping};
pub use tensor::Tensor;
pub use typing::{Scalar, Type};
