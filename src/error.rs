// ============================================================
// Errors
// ============================================================
// Every fallible operation in the model layer returns
// `crate::Result<T>`. File helpers in `infra` use anyhow
// instead and attach context to the failing path.

use thiserror::Error;

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building or running the model.
#[derive(Error, Debug)]
pub enum ModelError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A string option did not name a known variant.
    #[error("unknown {kind}: {value}")]
    UnknownOption { kind: &'static str, value: String },

    /// A pretrained table the config asks for was not supplied.
    #[error("missing pretrained table: {0}")]
    MissingTable(&'static str),

    /// A pretrained table has the wrong number of rows or columns.
    #[error("pretrained table '{name}' is {rows}x{dim}, expected {expected_rows}x{expected_dim}")]
    TableShape {
        name:          &'static str,
        rows:          usize,
        dim:           usize,
        expected_rows: usize,
        expected_dim:  usize,
    },

    /// Input tensors disagree on shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A gene or perturbation id has no row in its embedding table.
    #[error("{kind} id {id} outside an embedding table of {size} rows")]
    IdOutOfRange {
        kind: &'static str,
        id:   i64,
        size: usize,
    },

    /// A forward flag asked for a head the model was built without.
    #[error("decoder head not built: {0}")]
    HeadNotBuilt(&'static str),

    /// A masked reduction received an all-false mask.
    #[error("mask selects no elements")]
    EmptyMask,

    /// Reading tensor data back to the host failed.
    #[error("tensor data error: {0}")]
    TensorData(String),
}
