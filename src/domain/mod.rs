// ============================================================
// Domain Layer
// ============================================================
// Plain Rust structs, enums and traits shared by the model
// layer. Nothing in here touches burn tensors, so every item
// is testable without a backend.

/// Pretrained embedding tables (GenePT, drug embeddings)
pub mod tables;

/// Perturbation batches, gene selection and vocab mapping
pub mod perturbation;

/// Per-cell quantile binning of expression values
pub mod binning;

/// Abstractions implemented by the model layer
pub mod traits;
