// ============================================================
// Pretrained Embedding Store
// ============================================================
// Loads text-derived gene embeddings (or drug embeddings) from
// a JSON object keyed by name:
//
//   { "TP53": [0.013, -0.021, ...], "BRCA1": [...], ... }
//
// and aligns them to an ordered vocabulary so row i of the
// resulting table belongs to token i. Names missing from the
// file get a zero row.

use anyhow::{bail, Context, Result};
use std::{collections::HashMap, fs, path::PathBuf};

use crate::domain::tables::EmbeddingTable;

pub struct EmbeddingStore {
    path: PathBuf,
}

impl EmbeddingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the whole `name → vector` map.
    pub fn load_map(&self) -> Result<HashMap<String, Vec<f32>>> {
        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Cannot read embeddings from '{}'", self.path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("'{}' is not a name → vector JSON object", self.path.display()))
    }

    /// Builds a table with one row per `vocab` entry, in vocab order.
    pub fn load_aligned(&self, vocab: &[String]) -> Result<EmbeddingTable> {
        let map = self.load_map()?;
        let Some(dim) = map.values().next().map(Vec::len) else {
            bail!("'{}' contains no embeddings", self.path.display());
        };

        let mut table = EmbeddingTable::zeros(vocab.len(), dim);
        let mut missing = 0usize;
        for (row, name) in vocab.iter().enumerate() {
            match map.get(name) {
                Some(vector) if vector.len() == dim => table.set_row(row, vector)?,
                Some(vector) => bail!(
                    "embedding for '{name}' has {} values, expected {dim}",
                    vector.len()
                ),
                None => missing += 1,
            }
        }

        tracing::debug!(
            "Loaded {}x{} embedding table from '{}' ({} names without a vector)",
            vocab.len(), dim, self.path.display(), missing,
        );
        Ok(table)
    }
}
