use std::path::PathBuf;

use thiserror::Error;

use crate::typing::Type;

/// Errors raised while building, compiling or running tensor kernels.
#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor shape must not contain a zero dimension: {dims:?}")]
    ZeroDimension { dims: Vec<usize> },

    #[error("first dimension distribution sums to {sum}, expected {expected}")]
    InvalidDistribution { sum: usize, expected: usize },

    #[error("shapes {lhs} and {rhs} cannot be broadcast together")]
    IncompatibleBroadcast { lhs: String, rhs: String },

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: String, got: String },

    #[error("invalid dimension {dim} for tensor of rank {rank}")]
    InvalidDimension { dim: usize, rank: usize },

    #[error("invalid permutation {perm:?} for tensor of rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },

    #[error("operation {op} is not defined for {lhs} and {rhs}")]
    TypeMismatch { op: &'static str, lhs: Type, rhs: Type },

    #[error("unknown type name {0:?}")]
    UnknownType(String),

    #[error("invalid interval [{start}, {end})")]
    InvalidInterval { start: usize, end: usize },

    #[error("vertex {name} is malformed: {reason}")]
    MalformedVertex { name: String, reason: String },

    #[error("failed to compile vertex {name}: {reason}")]
    Compilation { name: String, reason: String },

    #[error("failed to load kernel object {path}: {reason}")]
    KernelLoad { path: PathBuf, reason: String },

    #[error("kernel execution failed: {0}")]
    Execution(String),

    #[error("kernel cache error: {0}")]
    Cache(String),

    #[error("buffer {0} is not allocated")]
    UnknownBuffer(u64),

    #[error("invalid argument {arg}: {reason}")]
    InvalidArgument { arg: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
