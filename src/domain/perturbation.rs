// ============================================================
// Perturbation batches
// ============================================================
// Host-side description of a "what-if" query: the control
// expression of each cell plus a per-gene perturbation flag.
//
// Two layouts arrive from upstream:
//
//   interleaved  [batch * n_genes, 2]   rows of (value, flag),
//                                        cell after cell
//   explicit     ctrl  [batch, n_genes]
//                flags [batch, n_genes]
//
// Both become the same `PerturbBatch`.

use std::collections::BTreeSet;

use crate::error::{ModelError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct PerturbBatch {
    batch_size:  usize,
    n_genes:     usize,
    /// Row-major `[batch_size, n_genes]` control expression.
    ctrl_values: Vec<f32>,
    /// Row-major `[batch_size, n_genes]` perturbation token per gene.
    pert_flags:  Vec<i64>,
}

impl PerturbBatch {
    pub fn new(ctrl_values: Vec<f32>, pert_flags: Vec<i64>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 || ctrl_values.len() % batch_size != 0 {
            return Err(ModelError::ShapeMismatch(format!(
                "{} control values do not split into {batch_size} cells",
                ctrl_values.len()
            )));
        }
        if pert_flags.len() != ctrl_values.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "{} perturbation flags for {} control values",
                pert_flags.len(),
                ctrl_values.len()
            )));
        }
        let n_genes = ctrl_values.len() / batch_size;
        Ok(Self { batch_size, n_genes, ctrl_values, pert_flags })
    }

    /// Builds a batch from `(value, flag)` rows stacked cell by cell.
    pub fn from_interleaved(x: &[[f32; 2]], batch_size: usize) -> Result<Self> {
        let ctrl_values = x.iter().map(|row| row[0]).collect();
        // flags are stored as floats next to the values; truncate like a long cast
        let pert_flags = x.iter().map(|row| row[1] as i64).collect();
        Self::new(ctrl_values, pert_flags, batch_size)
    }

    pub fn batch_size(&self) -> usize { self.batch_size }

    pub fn n_genes(&self) -> usize { self.n_genes }

    pub fn ctrl_values(&self) -> &[f32] { &self.ctrl_values }

    pub fn pert_flags(&self) -> &[i64] { &self.pert_flags }

    pub fn value(&self, cell: usize, gene: usize) -> f32 {
        self.ctrl_values[cell * self.n_genes + gene]
    }

    /// Gathers the given gene columns for every cell, row-major.
    pub fn gather_columns(&self, columns: &[usize]) -> (Vec<f32>, Vec<i64>) {
        let mut values = Vec::with_capacity(self.batch_size * columns.len());
        let mut flags  = Vec::with_capacity(self.batch_size * columns.len());
        for cell in 0..self.batch_size {
            let offset = cell * self.n_genes;
            for &gene in columns {
                values.push(self.ctrl_values[offset + gene]);
                flags.push(self.pert_flags[offset + gene]);
            }
        }
        (values, flags)
    }
}

/// Which gene columns are fed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeneSelection {
    /// Every gene column.
    All,
    /// Sorted columns with a non-zero control value in at least one cell.
    #[default]
    BatchWise,
}

impl std::str::FromStr for GeneSelection {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all"        => Ok(Self::All),
            "batch-wise" => Ok(Self::BatchWise),
            other        => Err(ModelError::UnknownOption {
                kind:  "gene selection",
                value: other.to_string(),
            }),
        }
    }
}

impl GeneSelection {
    pub fn select(&self, batch: &PerturbBatch) -> Vec<usize> {
        match self {
            Self::All => (0..batch.n_genes).collect(),
            Self::BatchWise => {
                let mut seen = BTreeSet::new();
                for cell in 0..batch.batch_size {
                    for gene in 0..batch.n_genes {
                        if batch.value(cell, gene) != 0.0 {
                            seen.insert(gene);
                        }
                    }
                }
                seen.into_iter().collect()
            }
        }
    }
}

/// Maps raw gene column indices to vocabulary ids.
///
/// `gene_ids[i]` is the vocab id of raw column `i`.
pub fn map_raw_id_to_vocab_id(raw_ids: &[usize], gene_ids: &[i64]) -> Result<Vec<i64>> {
    raw_ids
        .iter()
        .map(|&raw| {
            gene_ids.get(raw).copied().ok_or_else(|| {
                ModelError::ShapeMismatch(format!(
                    "raw gene id {raw} outside a vocab mapping of {} genes",
                    gene_ids.len()
                ))
            })
        })
        .collect()
}
