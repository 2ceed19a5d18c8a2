// ============================================================
// Core Traits
// ============================================================
// Callers that only want predicted expression profiles program
// against `PerturbationSimulator`; the transformer model is one
// implementation, a baseline that echoes the control profile
// would be another.

use crate::domain::perturbation::{GeneSelection, PerturbBatch};
use crate::error::Result;

/// Anything that can predict post-perturbation expression.
pub trait PerturbationSimulator {
    /// Predicts a row-major `[batch_size, n_genes]` expression matrix.
    ///
    /// `gene_ids[i]` is the vocabulary id of raw gene column `i`.
    /// Columns left out by `selection` are reported as zero.
    fn simulate(
        &self,
        batch:     &PerturbBatch,
        selection: GeneSelection,
        gene_ids:  &[i64],
    ) -> Result<Vec<f32>>;
}
