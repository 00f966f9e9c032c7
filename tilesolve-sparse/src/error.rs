use thiserror::Error;

/// Errors raised while decomposing matrices or running solvers.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Kernel(#[from] tilesolve_kerpiler::Error),

    #[error("matrix is malformed: {0}")]
    Matrix(String),

    #[error("graph partitioning failed: {0}")]
    Partitioning(String),

    #[error("tile layout is inconsistent: {0}")]
    Layout(String),

    #[error("vector {what} does not fit the matrix layout: {reason}")]
    IncompatibleVector { what: &'static str, reason: String },

    #[error("solver {solver} failed: {reason}")]
    Solver { solver: String, reason: String },

    #[error("invalid solver configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
