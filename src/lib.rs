// ============================================================
// scgenept
// ============================================================
// Transformer that predicts post-perturbation single-cell gene
// expression from control expression plus per-gene
// perturbation flags.
//
//   domain  plain data: pretrained tables, perturbation batches,
//           value binning
//   ml      the burn model graph, heads and losses
//   infra   pretrained embedding loading

#![recursion_limit = "256"]

pub mod domain;
pub mod error;
pub mod infra;
pub mod ml;

pub use domain::{
    perturbation::{GeneSelection, PerturbBatch},
    tables::{EmbeddingTable, PretrainedEmbeddings},
    traits::PerturbationSimulator,
};
pub use error::{ModelError, Result};
pub use ml::{
    config::{CellEmbStyle, DecoderActivation, EmbeddingBranch, MvcDecoderStyle, ScGenePtConfig},
    model::{ForwardOptions, ModelInput, ModelOutput, ScGenePtModel},
    predictor::PerturbationPredictor,
};
