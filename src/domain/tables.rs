use crate::error::{ModelError, Result};

/// Row-major host matrix of pretrained vectors, one row per token.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    rows:   usize,
    dim:    usize,
    values: Vec<f32>,
}

impl EmbeddingTable {
    pub fn new(rows: usize, dim: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != rows * dim {
            return Err(ModelError::ShapeMismatch(format!(
                "embedding table has {} values, expected {rows}x{dim}",
                values.len()
            )));
        }
        Ok(Self { rows, dim, values })
    }

    /// Table of zeros, handy as a starting point for aligned lookups.
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self { rows, dim, values: vec![0.0; rows * dim] }
    }

    pub fn rows(&self) -> usize { self.rows }

    pub fn dim(&self) -> usize { self.dim }

    pub fn values(&self) -> &[f32] { &self.values }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        (index < self.rows).then(|| &self.values[index * self.dim..(index + 1) * self.dim])
    }

    pub fn set_row(&mut self, index: usize, row: &[f32]) -> Result<()> {
        if index >= self.rows || row.len() != self.dim {
            return Err(ModelError::ShapeMismatch(format!(
                "cannot write a {}-vector into row {index} of a {}x{} table",
                row.len(), self.rows, self.dim
            )));
        }
        self.values[index * self.dim..(index + 1) * self.dim].copy_from_slice(row);
        Ok(())
    }

    /// Checks the table against the shape a branch expects.
    pub(crate) fn expect_shape(
        &self,
        name:          &'static str,
        expected_rows: usize,
        expected_dim:  usize,
    ) -> Result<()> {
        if self.rows != expected_rows || self.dim != expected_dim {
            return Err(ModelError::TableShape {
                name,
                rows: self.rows,
                dim:  self.dim,
                expected_rows,
                expected_dim,
            });
        }
        Ok(())
    }
}

/// Pretrained tables handed to model construction.
///
/// * `gene_pt` — text-derived gene embeddings, one row per vocab token.
/// * `drug`    — perturbagen embeddings used when the perturbation branch
///   runs in drug mode.
#[derive(Debug, Clone, Default)]
pub struct PretrainedEmbeddings {
    pub gene_pt: Option<EmbeddingTable>,
    pub drug:    Option<EmbeddingTable>,
}

impl PretrainedEmbeddings {
    pub fn with_gene_pt(mut self, table: EmbeddingTable) -> Self {
        self.gene_pt = Some(table);
        self
    }

    pub fn with_drug(mut self, table: EmbeddingTable) -> Self {
        self.drug = Some(table);
        self
    }
}
