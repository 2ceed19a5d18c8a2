// ============================================================
// Perturbation Predictor
// ============================================================
// Runs a "what-if" query end to end:
//
//   1. pick the gene columns to feed (all / batch-wise)
//   2. map raw gene columns to vocab ids
//   3. forward with sampling on and no padding
//   4. scatter predictions back to [batch, n_genes]
//
// Build it from `model.valid()` so dropout stays off.

use burn::prelude::*;

use crate::domain::{
    perturbation::{map_raw_id_to_vocab_id, GeneSelection, PerturbBatch},
    traits::PerturbationSimulator,
};
use crate::error::{ModelError, Result};
use crate::ml::model::{ForwardOptions, ModelInput, ScGenePtModel};

pub struct PerturbationPredictor<B: Backend> {
    model:  ScGenePtModel<B>,
    device: B::Device,
}

impl<B: Backend> PerturbationPredictor<B> {
    pub fn new(model: ScGenePtModel<B>, device: B::Device) -> Self {
        if B::ad_enabled() {
            tracing::warn!("Predictor built on an autodiff backend; dropout stays active. Use model.valid()");
        }
        Self { model, device }
    }

    pub fn model(&self) -> &ScGenePtModel<B> {
        &self.model
    }

    /// Predicts post-perturbation expression, `[batch_size, n_genes]`.
    ///
    /// Columns left out by `selection` come back as zero.
    pub fn pred_perturb(
        &self,
        batch:     &PerturbBatch,
        selection: GeneSelection,
        gene_ids:  &[i64],
    ) -> Result<Tensor<B, 2>> {
        let host = self.predict_host(batch, selection, gene_ids)?;
        Ok(Tensor::<B, 1>::from_floats(host.as_slice(), &self.device)
            .reshape([batch.batch_size(), batch.n_genes()]))
    }

    fn predict_host(
        &self,
        batch:     &PerturbBatch,
        selection: GeneSelection,
        gene_ids:  &[i64],
    ) -> Result<Vec<f32>> {
        let mut predicted = vec![0.0f32; batch.batch_size() * batch.n_genes()];

        let columns = selection.select(batch);
        if columns.is_empty() {
            tracing::debug!("No gene columns selected, returning zeros");
            return Ok(predicted);
        }

        let vocab_ids = map_raw_id_to_vocab_id(&columns, gene_ids)?;
        let (values, flags) = batch.gather_columns(&columns);
        let n_cols = columns.len();

        // every cell sees the same gene order
        let src: Vec<i64> = (0..batch.batch_size()).flat_map(|_| vocab_ids.iter().copied()).collect();

        let shape = [batch.batch_size(), n_cols];
        let input = ModelInput::new(
            Tensor::<B, 1, Int>::from_ints(src.as_slice(), &self.device).reshape(shape),
            Tensor::<B, 1>::from_floats(values.as_slice(), &self.device).reshape(shape),
            Tensor::<B, 1, Int>::from_ints(flags.as_slice(), &self.device).reshape(shape),
        );

        let output = self.model.forward(input, ForwardOptions::default().with_sampling())?;
        let output: Vec<f32> = output
            .mlm_output
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| ModelError::TensorData(format!("{e:?}")))?;

        for cell in 0..batch.batch_size() {
            for (k, &gene) in columns.iter().enumerate() {
                predicted[cell * batch.n_genes() + gene] = output[cell * n_cols + k];
            }
        }

        tracing::debug!(
            "Predicted {} cells over {} of {} genes",
            batch.batch_size(), n_cols, batch.n_genes(),
        );
        Ok(predicted)
    }
}

impl<B: Backend> PerturbationSimulator for PerturbationPredictor<B> {
    fn simulate(
        &self,
        batch:     &PerturbBatch,
        selection: GeneSelection,
        gene_ids:  &[i64],
    ) -> Result<Vec<f32>> {
        self.predict_host(batch, selection, gene_ids)
    }
}
