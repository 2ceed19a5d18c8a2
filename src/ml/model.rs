// ============================================================
// scGenePT Generator
// ============================================================
// Token embedding per gene = sum of the enabled branches
//
//   gene id     ─► GeneEncoder ─────────┐
//   gene id     ─► GenePtEncoder ───────┤
//   expression  ─► ContinuousValueEnc. ─┼─► Σ ─► transformer ─► heads
//   pert token  ─► PertEncoder ─────────┘
//
// Heads on the encoder output:
//   decoder      affine expression regression (+ zero prob)
//   cls_decoder  cell-type logits from the cell embedding
//   mvc_decoder  masked value consistency (optional)
//   ECS / CCE    similarity regularizers on the cell embedding
//
// Training mode is "running on an autodiff backend": dropout
// only fires there, and `model.valid()` gives the eval model.

use burn::{
    module::Ignored,
    prelude::*,
    tensor::Distribution,
};

use crate::domain::{binning::binning, tables::PretrainedEmbeddings};
use crate::error::{ModelError, Result};
use crate::ml::{
    config::{CellEmbStyle, EmbeddingBranch, ScGenePtConfig},
    decoders::{AffineExprDecoder, ClsDecoder, MvcDecoder},
    encoders::{ContinuousValueEncoder, GeneEncoder, GenePtEncoder, PertEncoder},
    regularizers::{contrastive_cell_loss, elastic_cell_similarity, l2_normalize, Similarity},
    transformer::{GeneTransformer, GeneTransformerConfig},
};

impl ScGenePtConfig {
    /// Builds the model, pulling pretrained tables for the branches that
    /// need them.
    pub fn init<B: Backend>(
        &self,
        pretrained: &PretrainedEmbeddings,
        device:     &B::Device,
    ) -> Result<ScGenePtModel<B>> {
        self.validate()?;
        if self.use_fast_transformer {
            tracing::warn!("fast attention kernels are not available, using the standard encoder");
        }

        let gene_encoder = self
            .includes(EmbeddingBranch::GeneTokens)
            .then(|| GeneEncoder::new(self.ntoken, self.d_model, device));

        let genept_encoder = if self.includes(EmbeddingBranch::GenePtTokens) {
            let table = pretrained.gene_pt.as_ref().ok_or(ModelError::MissingTable("gene_pt"))?;
            table.expect_shape("gene_pt", self.ntoken, self.genept_embs_size)?;
            Some(GenePtEncoder::new(table, self.d_model, device))
        } else {
            None
        };

        let value_encoder = self
            .includes(EmbeddingBranch::GeneCounts)
            .then(|| ContinuousValueEncoder::new(self.d_model, self.dropout, device));

        let pert_encoder = if self.use_drug_embeds {
            let table = pretrained.drug.as_ref().ok_or(ModelError::MissingTable("drug"))?;
            table.expect_shape("drug", table.rows(), self.genept_embs_size)?;
            PertEncoder::drugs(table, self.d_model, device)
        } else {
            PertEncoder::tokens(self.n_pert_tokens, self.d_model, self.pert_pad_id, device)
        };

        let transformer = GeneTransformerConfig::new(self.d_model, self.nhead, self.d_hid, self.nlayers)
            .with_dropout(self.dropout)
            .with_pre_norm(self.pre_norm)
            .init(device);

        let decoder = AffineExprDecoder::new(
            self.d_model,
            self.explicit_zero_prob,
            self.decoder_activation,
            self.decoder_adaptive_bias,
            device,
        );
        let cls_decoder = ClsDecoder::new(self.d_model, self.n_cls, self.nlayers_cls, device);
        let mvc_decoder = self.do_mvc.then(|| {
            MvcDecoder::new(self.d_model, self.mvc_decoder_style, self.explicit_zero_prob, device)
        });

        tracing::info!(
            "Model ready: branches={:?}, {} layers, d_model={}, drug_embeds={}",
            self.embs_to_include, self.nlayers, self.d_model, self.use_drug_embeds,
        );

        Ok(ScGenePtModel {
            gene_encoder,
            genept_encoder,
            value_encoder,
            pert_encoder,
            transformer,
            decoder,
            cls_decoder,
            mvc_decoder,
            settings: Ignored(HeadSettings {
                cell_emb_style:     self.cell_emb_style,
                explicit_zero_prob: self.explicit_zero_prob,
                n_input_bins:       self.n_input_bins,
                ecs_threshold:      self.ecs_threshold,
                cce_temperature:    self.cce_temperature,
            }),
        })
    }
}

/// Non-trainable settings the forward pass reads.
#[derive(Debug, Clone, Copy)]
pub struct HeadSettings {
    pub cell_emb_style:     CellEmbStyle,
    pub explicit_zero_prob: bool,
    pub n_input_bins:       usize,
    pub ecs_threshold:      f64,
    pub cce_temperature:    f64,
}

#[derive(Module, Debug)]
pub struct ScGenePtModel<B: Backend> {
    pub gene_encoder:   Option<GeneEncoder<B>>,
    pub genept_encoder: Option<GenePtEncoder<B>>,
    pub value_encoder:  Option<ContinuousValueEncoder<B>>,
    pub pert_encoder:   PertEncoder<B>,
    pub transformer:    GeneTransformer<B>,
    pub decoder:        AffineExprDecoder<B>,
    pub cls_decoder:    ClsDecoder<B>,
    pub mvc_decoder:    Option<MvcDecoder<B>>,
    pub settings:       Ignored<HeadSettings>,
}

/// One batch of gene tokens. All tensors are `[batch, seq_len]`.
#[derive(Debug, Clone)]
pub struct ModelInput<B: Backend> {
    /// Vocabulary ids of the genes.
    pub src:          Tensor<B, 2, Int>,
    /// Control expression values.
    pub values:       Tensor<B, 2>,
    /// Perturbation token per gene.
    pub pert_flags:   Tensor<B, 2, Int>,
    /// true marks padded positions.
    pub padding_mask: Option<Tensor<B, 2, Bool>>,
}

impl<B: Backend> ModelInput<B> {
    pub fn new(src: Tensor<B, 2, Int>, values: Tensor<B, 2>, pert_flags: Tensor<B, 2, Int>) -> Self {
        Self { src, values, pert_flags, padding_mask: None }
    }

    pub fn with_padding_mask(mut self, mask: Tensor<B, 2, Bool>) -> Self {
        self.padding_mask = Some(mask);
        self
    }

    pub fn dims(&self) -> [usize; 2] {
        self.src.dims()
    }

    fn check_shapes(&self) -> Result<()> {
        let expected = self.src.dims();
        let mut shapes = vec![("values", self.values.dims()), ("pert_flags", self.pert_flags.dims())];
        if let Some(mask) = &self.padding_mask {
            shapes.push(("padding_mask", mask.dims()));
        }
        for (name, dims) in shapes {
            if dims != expected {
                return Err(ModelError::ShapeMismatch(format!(
                    "{name} is {dims:?} but src is {expected:?}"
                )));
            }
        }
        Ok(())
    }

    /// Rows `start..end` of every tensor.
    fn slice_batch(&self, start: usize, end: usize) -> Self {
        let [_, seq_len] = self.dims();
        Self {
            src:          self.src.clone().slice([start..end, 0..seq_len]),
            values:       self.values.clone().slice([start..end, 0..seq_len]),
            pert_flags:   self.pert_flags.clone().slice([start..end, 0..seq_len]),
            padding_mask: self.padding_mask.clone().map(|m| m.slice([start..end, 0..seq_len])),
        }
    }
}

/// Which optional heads a forward pass computes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Cell-type classification.
    pub cls:       bool,
    /// Contrastive cell embedding loss.
    pub cce:       bool,
    /// Masked value consistency.
    pub mvc:       bool,
    /// Elastic cell similarity loss.
    pub ecs:       bool,
    /// Sample zero-inflated outputs instead of returning the mean.
    pub do_sample: bool,
}

impl ForwardOptions {
    pub fn with_cls(mut self) -> Self { self.cls = true; self }

    pub fn with_cce(mut self) -> Self { self.cce = true; self }

    pub fn with_mvc(mut self) -> Self { self.mvc = true; self }

    pub fn with_ecs(mut self) -> Self { self.ecs = true; self }

    pub fn with_sampling(mut self) -> Self { self.do_sample = true; self }
}

/// Encoder output plus the summed gene-token embeddings that fed it.
#[derive(Debug, Clone)]
pub struct Encoded<B: Backend> {
    /// [batch, seq_len, d_model]
    pub output:          Tensor<B, 3>,
    /// [batch, seq_len, d_model], None when no gene-token branch is enabled
    pub gene_token_embs: Option<Tensor<B, 3>>,
}

#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// [batch, seq_len] predicted expression (sampled when zero-inflated)
    pub mlm_output:     Tensor<B, 2>,
    pub mlm_zero_probs: Option<Tensor<B, 2>>,
    /// [batch, d_model]
    pub cell_emb:       Tensor<B, 2>,
    /// [batch, n_cls]
    pub cls_output:     Option<Tensor<B, 2>>,
    pub mvc_output:     Option<Tensor<B, 2>>,
    pub mvc_zero_probs: Option<Tensor<B, 2>>,
    pub loss_cce:       Option<Tensor<B, 1>>,
    pub loss_ecs:       Option<Tensor<B, 1>>,
}

impl<B: Backend> ScGenePtModel<B> {
    /// Sums the enabled embedding branches and runs the transformer.
    pub fn encode(
        &self,
        src:          Tensor<B, 2, Int>,
        values:       Tensor<B, 2>,
        pert_flags:   Tensor<B, 2, Int>,
        padding_mask: Option<Tensor<B, 2, Bool>>,
    ) -> Encoded<B> {
        let gene_token_embs = match (&self.gene_encoder, &self.genept_encoder) {
            (Some(gene), Some(genept)) => {
                Some(gene.forward(src.clone()) + genept.forward(src))
            }
            (Some(gene), None)   => Some(gene.forward(src)),
            (None, Some(genept)) => Some(genept.forward(src)),
            (None, None)         => None,
        };

        let mut total = self.pert_encoder.forward(pert_flags);
        if let Some(embs) = &gene_token_embs {
            total = total + embs.clone();
        }
        if let Some(value_encoder) = &self.value_encoder {
            total = total + value_encoder.forward(values);
        }

        let output = self.transformer.forward(total, padding_mask);
        Encoded { output, gene_token_embs }
    }

    /// Pools `[batch, seq_len, d_model]` into `[batch, d_model]`.
    ///
    /// `weights` are only read by the weighted-pool style.
    pub fn cell_embedding(&self, layer_output: Tensor<B, 3>, weights: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, seq_len, d_model] = layer_output.dims();
        match self.settings.0.cell_emb_style {
            CellEmbStyle::Cls => layer_output
                .slice([0..batch, 0..1, 0..d_model])
                .reshape([batch, d_model]),
            CellEmbStyle::AvgPool => layer_output.mean_dim(1).reshape([batch, d_model]),
            CellEmbStyle::WPool => {
                let weights = weights.reshape([batch, seq_len, 1]);
                let pooled = (layer_output * weights).sum_dim(1).reshape([batch, d_model]);
                l2_normalize(pooled)
            }
        }
    }

    /// Rejects gene or perturbation ids that have no embedding row.
    fn check_ids(&self, input: &ModelInput<B>) -> Result<()> {
        let vocab = match (&self.gene_encoder, &self.genept_encoder) {
            (Some(gene), _)      => Some(gene.embedding.weight.dims()[0]),
            (None, Some(genept)) => Some(genept.embedding.weight.dims()[0]),
            (None, None)         => None,
        };
        if let Some(size) = vocab {
            check_id_range(&input.src, "gene", size)?;
        }
        let n_pert = self.pert_encoder.embedding.weight.dims()[0];
        check_id_range(&input.pert_flags, "perturbation", n_pert)
    }

    pub fn forward(&self, input: ModelInput<B>, options: ForwardOptions) -> Result<ModelOutput<B>> {
        input.check_shapes()?;
        self.check_ids(&input)?;
        let settings = self.settings.0;

        let mvc_decoder = match (options.mvc, &self.mvc_decoder) {
            (true, None) => return Err(ModelError::HeadNotBuilt("mvc")),
            (true, Some(decoder)) => Some(decoder),
            (false, _) => None,
        };

        let mut do_sample = options.do_sample;
        if settings.explicit_zero_prob && !do_sample && !B::ad_enabled() {
            tracing::warn!("Auto set do_sample to true when the model runs in eval mode");
            do_sample = true;
        }

        let [batch, seq_len] = input.dims();
        tracing::debug!("forward: batch={} seq_len={} options={:?}", batch, seq_len, options);

        let ModelInput { src, values, pert_flags, padding_mask } = input;
        let processed_values = if settings.n_input_bins > 0 {
            bin_values(values.clone(), settings.n_input_bins)?
        } else {
            values.clone()
        };

        let encoded = self.encode(
            src.clone(),
            processed_values.clone(),
            pert_flags.clone(),
            padding_mask.clone(),
        );

        let mlm = self.decoder.forward(encoded.output.clone(), values.clone());
        let mlm_output = match (&mlm.zero_probs, do_sample) {
            (Some(probs), true) => sample_bernoulli(probs.clone()) * mlm.pred,
            _ => mlm.pred,
        };

        let cell_emb = self.cell_embedding(encoded.output, values.clone());

        let cls_output = options.cls.then(|| self.cls_decoder.forward(cell_emb.clone()));

        let (mut mvc_output, mut mvc_zero_probs) = (None, None);
        if let Some(decoder) = mvc_decoder {
            let gene_embs = encoded.gene_token_embs.ok_or(ModelError::HeadNotBuilt("gene token embeddings"))?;
            let mvc = decoder.forward(cell_emb.clone(), gene_embs);
            mvc_output = Some(match (&mvc.zero_probs, do_sample) {
                (Some(probs), true) => sample_bernoulli(probs.clone()) * mvc.pred,
                _ => mvc.pred,
            });
            mvc_zero_probs = mvc.zero_probs;
        }

        // second pass gives a dropout-perturbed view of the same cells
        let loss_cce = options.cce.then(|| {
            let second = self.encode(src, processed_values, pert_flags, padding_mask);
            let view2 = self.cell_embedding(second.output, values);
            contrastive_cell_loss(cell_emb.clone(), view2, Similarity::new(settings.cce_temperature))
        });

        let loss_ecs = options
            .ecs
            .then(|| elastic_cell_similarity(cell_emb.clone(), settings.ecs_threshold));

        Ok(ModelOutput {
            mlm_output,
            mlm_zero_probs: mlm.zero_probs,
            cell_emb,
            cls_output,
            mvc_output,
            mvc_zero_probs,
            loss_cce,
            loss_ecs,
        })
    }

    /// Encodes `input` in chunks of `batch_size` cells and concatenates the
    /// results along the batch dimension.
    pub fn encode_batch(&self, input: &ModelInput<B>, batch_size: usize) -> Result<Tensor<B, 3>> {
        if batch_size == 0 {
            return Err(ModelError::InvalidConfig("encode_batch needs a positive batch size".to_string()));
        }
        input.check_shapes()?;
        self.check_ids(input)?;

        let [n_cells, _] = input.dims();
        let outputs: Vec<Tensor<B, 3>> = (0..n_cells)
            .step_by(batch_size)
            .map(|start| {
                let chunk = input.slice_batch(start, (start + batch_size).min(n_cells));
                tracing::debug!("encoding cells {}..{}", start, start + chunk.dims()[0]);
                self.encode(chunk.src, chunk.values, chunk.pert_flags, chunk.padding_mask).output
            })
            .collect();

        if outputs.is_empty() {
            return Err(ModelError::ShapeMismatch("encode_batch received no cells".to_string()));
        }
        Ok(Tensor::cat(outputs, 0))
    }
}

fn check_id_range<B: Backend>(ids: &Tensor<B, 2, Int>, kind: &'static str, size: usize) -> Result<()> {
    if ids.dims().iter().product::<usize>() == 0 {
        return Ok(());
    }
    let min: i64 = ids.clone().min().into_scalar().elem();
    let max: i64 = ids.clone().max().into_scalar().elem();
    for id in [min, max] {
        if id < 0 || id as usize >= size {
            return Err(ModelError::IdOutOfRange { kind, id, size });
        }
    }
    Ok(())
}

/// Bernoulli draw per element: 1 with probability `probs`, else 0.
fn sample_bernoulli<B: Backend, const D: usize>(probs: Tensor<B, D>) -> Tensor<B, D> {
    let uniform = Tensor::<B, D>::random(probs.shape(), Distribution::Default, &probs.device());
    uniform.lower(probs).float()
}

/// Bins every cell's values on the host.
fn bin_values<B: Backend>(values: Tensor<B, 2>, n_bins: usize) -> Result<Tensor<B, 2>> {
    let [batch, seq_len] = values.dims();
    let device = values.device();
    let host: Vec<f32> = values
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| ModelError::TensorData(format!("{e:?}")))?;

    let mut rng = rand::thread_rng();
    let binned: Vec<f32> = host
        .chunks(seq_len.max(1))
        .flat_map(|row| binning(row, n_bins, &mut rng))
        .collect();

    Ok(Tensor::<B, 1>::from_floats(binned.as_slice(), &device).reshape([batch, seq_len]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tables::EmbeddingTable;
    use crate::ml::loss::masked_mse_loss;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::AutodiffModule;

    type B = NdArray;
    type AB = Autodiff<NdArray>;

    const NTOKEN: usize = 10;
    const GENEPT_DIM: usize = 4;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config() -> ScGenePtConfig {
        ScGenePtConfig::new(NTOKEN, 8, 2, 16, 2, 3, 4)
            .with_dropout(0.0)
            .with_genept_embs_size(GENEPT_DIM)
    }

    fn pretrained() -> PretrainedEmbeddings {
        let values = (0..NTOKEN * GENEPT_DIM).map(|v| (v as f32 * 0.37).sin()).collect();
        PretrainedEmbeddings::default()
            .with_gene_pt(EmbeddingTable::new(NTOKEN, GENEPT_DIM, values).unwrap())
    }

    fn input<BB: Backend>(device: &BB::Device) -> ModelInput<BB> {
        let src = Tensor::<BB, 1, Int>::from_ints([1, 2, 3, 4, 5, 6, 7, 8], device).reshape([2, 4]);
        let values = Tensor::<BB, 1>::from_floats([0.0, 1.5, 2.0, 0.0, 3.0, 0.0, 0.5, 4.0], device)
            .reshape([2, 4]);
        let pert = Tensor::<BB, 1, Int>::from_ints([0, 1, 0, 0, 0, 0, 1, 0], device).reshape([2, 4]);
        ModelInput::new(src, values, pert)
    }

    fn max_abs_diff<const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> f32 {
        (a - b).abs().max().into_scalar().elem()
    }

    #[test]
    fn test_forward_all_heads() {
        init_logging();
        let device = Default::default();
        let model: ScGenePtModel<B> = config()
            .with_do_mvc(true)
            .init(&pretrained(), &device)
            .unwrap();

        let options = ForwardOptions::default().with_cls().with_cce().with_mvc().with_ecs();
        let out = model.forward(input(&device), options).unwrap();

        assert_eq!(out.mlm_output.dims(), [2, 4]);
        assert_eq!(out.cell_emb.dims(), [2, 8]);
        assert_eq!(out.cls_output.unwrap().dims(), [2, 4]);
        assert_eq!(out.mvc_output.unwrap().dims(), [2, 4]);
        assert!(out.mlm_zero_probs.is_none());
        assert!(out.loss_cce.is_some());
        assert!(out.loss_ecs.is_some());
    }

    #[test]
    fn test_optional_heads_are_skipped() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config().init(&pretrained(), &device).unwrap();
        let out = model.forward(input(&device), ForwardOptions::default()).unwrap();
        assert!(out.cls_output.is_none());
        assert!(out.mvc_output.is_none());
        assert!(out.loss_cce.is_none());
        assert!(out.loss_ecs.is_none());
    }

    #[test]
    fn test_mvc_without_head_is_an_error() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config().init(&pretrained(), &device).unwrap();
        let res = model.forward(input(&device), ForwardOptions::default().with_mvc());
        assert!(matches!(res, Err(ModelError::HeadNotBuilt("mvc"))));
    }

    #[test]
    fn test_missing_gene_pt_table() {
        let device = Default::default();
        let res = config().init::<B>(&PretrainedEmbeddings::default(), &device);
        assert!(matches!(res, Err(ModelError::MissingTable("gene_pt"))));

        let wrong = PretrainedEmbeddings::default().with_gene_pt(EmbeddingTable::zeros(NTOKEN, 3));
        assert!(matches!(config().init::<B>(&wrong, &device), Err(ModelError::TableShape { .. })));
    }

    #[test]
    fn test_branches_without_pretrained_table() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config()
            .with_embs_to_include(vec![EmbeddingBranch::GeneCounts, EmbeddingBranch::GeneTokens])
            .init(&PretrainedEmbeddings::default(), &device)
            .unwrap();
        assert!(model.genept_encoder.is_none());
        assert!(model.forward(input(&device), ForwardOptions::default()).is_ok());
    }

    #[test]
    fn test_drug_mode_needs_table() {
        let device = Default::default();
        let cfg = config().with_use_drug_embeds(true);
        assert!(matches!(
            cfg.init::<B>(&pretrained(), &device),
            Err(ModelError::MissingTable("drug"))
        ));

        let tables = pretrained().with_drug(EmbeddingTable::zeros(3, GENEPT_DIM));
        let model: ScGenePtModel<B> = cfg.init(&tables, &device).unwrap();
        assert!(model.pert_encoder.projection.is_some());
    }

    #[test]
    fn test_shape_mismatch() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config().init(&pretrained(), &device).unwrap();
        let mut bad = input::<B>(&device);
        bad.values = Tensor::zeros([2, 3], &device);
        assert!(matches!(
            model.forward(bad, ForwardOptions::default()),
            Err(ModelError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_zero_inflated_output_is_sampled_in_eval() {
        init_logging();
        let device = Default::default();
        let model: ScGenePtModel<B> = config()
            .with_explicit_zero_prob(true)
            .init(&pretrained(), &device)
            .unwrap();
        let out = model.forward(input(&device), ForwardOptions::default()).unwrap();
        let probs: Vec<f32> = out.mlm_zero_probs.unwrap().into_data().to_vec().unwrap();
        assert_eq!(probs.len(), 8);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_sample_bernoulli_extremes() {
        let device = Default::default();
        let zeros = sample_bernoulli(Tensor::<B, 2>::zeros([3, 5], &device));
        let ones  = sample_bernoulli(Tensor::<B, 2>::ones([3, 5], &device));
        let zeros: Vec<f32> = zeros.into_data().to_vec().unwrap();
        let ones: Vec<f32>  = ones.into_data().to_vec().unwrap();
        assert!(zeros.iter().all(|&v| v == 0.0));
        assert!(ones.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_eval_sampling_keeps_pred_or_zero() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config()
            .with_explicit_zero_prob(true)
            .init(&pretrained(), &device)
            .unwrap();
        let input = input::<B>(&device);

        let encoded = model.encode(input.src.clone(), input.values.clone(), input.pert_flags.clone(), None);
        let pred: Vec<f32> = model
            .decoder
            .forward(encoded.output, input.values.clone())
            .pred
            .into_data()
            .to_vec()
            .unwrap();

        let out = model.forward(input, ForwardOptions::default()).unwrap();
        let sampled: Vec<f32> = out.mlm_output.into_data().to_vec().unwrap();
        for (s, p) in sampled.iter().zip(&pred) {
            assert!(*s == 0.0 || (s - p).abs() < 1e-5, "{s} is neither 0 nor {p}");
        }
    }

    #[test]
    fn test_training_mode_does_not_sample_by_default() {
        let device = Default::default();
        let model: ScGenePtModel<AB> = config()
            .with_explicit_zero_prob(true)
            .init(&pretrained(), &device)
            .unwrap();
        let input = input::<AB>(&device);

        let encoded = model.encode(input.src.clone(), input.values.clone(), input.pert_flags.clone(), None);
        let pred = model.decoder.forward(encoded.output, input.values.clone()).pred;

        let out = model.forward(input, ForwardOptions::default()).unwrap();
        assert!(out.mlm_zero_probs.is_some());
        assert!(max_abs_diff(out.mlm_output.inner(), pred.inner()) < 1e-6);
    }

    #[test]
    fn test_out_of_range_ids_are_errors() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config().init(&pretrained(), &device).unwrap();

        let mut bad_gene = input::<B>(&device);
        bad_gene.src = Tensor::<B, 1, Int>::from_ints([1, 2, 3, 4, 5, 6, 7, NTOKEN as i32], &device)
            .reshape([2, 4]);
        assert!(matches!(
            model.forward(bad_gene, ForwardOptions::default()),
            Err(ModelError::IdOutOfRange { kind: "gene", .. })
        ));

        let mut bad_pert = input::<B>(&device);
        bad_pert.pert_flags = Tensor::<B, 1, Int>::from_ints([0, 7, 0, 0, 0, 0, 1, 0], &device)
            .reshape([2, 4]);
        assert!(matches!(
            model.encode_batch(&bad_pert, 1),
            Err(ModelError::IdOutOfRange { kind: "perturbation", id: 7, size: 3 })
        ));
        assert!(matches!(
            model.forward(bad_pert, ForwardOptions::default()),
            Err(ModelError::IdOutOfRange { kind: "perturbation", .. })
        ));
    }

    #[test]
    fn test_cell_embedding_styles() {
        let device = Default::default();
        let layer = Tensor::<B, 1>::from_floats(
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &device,
        ).reshape([1, 4, 2]);
        let weights = Tensor::<B, 1>::from_floats([1.0, 0.0, 0.0, 1.0], &device).reshape([1, 4]);

        let embed = |style: CellEmbStyle| -> Vec<f32> {
            let model: ScGenePtModel<B> = config()
                .with_cell_emb_style(style)
                .init(&pretrained(), &device)
                .unwrap();
            model
                .cell_embedding(layer.clone(), weights.clone())
                .into_data()
                .to_vec()
                .unwrap()
        };

        assert_eq!(embed(CellEmbStyle::Cls), vec![1.0, 2.0]);
        assert_eq!(embed(CellEmbStyle::AvgPool), vec![4.0, 5.0]);
        // (1,2) + (7,8) = (8,10), normalised
        let w = embed(CellEmbStyle::WPool);
        let norm = (8.0f32 * 8.0 + 10.0 * 10.0).sqrt();
        assert!((w[0] - 8.0 / norm).abs() < 1e-5);
        assert!((w[1] - 10.0 / norm).abs() < 1e-5);
    }

    #[test]
    fn test_encode_batch_matches_single_pass() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config().init(&pretrained(), &device).unwrap();
        let input = input::<B>(&device);

        let full = model
            .encode(input.src.clone(), input.values.clone(), input.pert_flags.clone(), None)
            .output;
        let chunked = model.encode_batch(&input, 1).unwrap();
        assert_eq!(chunked.dims(), [2, 4, 8]);
        assert!(max_abs_diff(full, chunked) < 1e-5);
        assert!(model.encode_batch(&input, 0).is_err());
    }

    #[test]
    fn test_binned_inputs() {
        let device = Default::default();
        let model: ScGenePtModel<B> = config()
            .with_n_input_bins(5)
            .init(&pretrained(), &device)
            .unwrap();
        let out = model.forward(input(&device), ForwardOptions::default()).unwrap();
        assert_eq!(out.mlm_output.dims(), [2, 4]);
    }

    #[test]
    fn test_gradients_reach_every_branch() {
        let device = Default::default();
        let model: ScGenePtModel<AB> = config()
            .with_do_mvc(true)
            .init(&pretrained(), &device)
            .unwrap();

        let input = input::<AB>(&device);
        let target = input.values.clone();
        let mask = target.clone().greater_elem(0.0);
        let out = model
            .forward(input, ForwardOptions::default().with_mvc().with_ecs())
            .unwrap();

        let loss = masked_mse_loss(out.mlm_output, target.clone(), mask.clone())
            + masked_mse_loss(out.mvc_output.unwrap(), target, mask)
            + out.loss_ecs.unwrap();
        let grads = loss.backward();

        let gene = model.gene_encoder.as_ref().unwrap();
        let genept = model.genept_encoder.as_ref().unwrap();
        let value = model.value_encoder.as_ref().unwrap();
        assert!(gene.embedding.weight.grad(&grads).is_some());
        assert!(genept.embedding.weight.grad(&grads).is_some());
        assert!(genept.fc.weight.grad(&grads).is_some());
        assert!(value.linear1.weight.grad(&grads).is_some());
        assert!(model.pert_encoder.embedding.weight.grad(&grads).is_some());
    }

    #[test]
    fn test_valid_model_matches_autodiff_without_dropout() {
        let device = Default::default();
        let model: ScGenePtModel<AB> = config().init(&pretrained(), &device).unwrap();
        let eval = model.valid();

        let train_out = model.forward(input(&device), ForwardOptions::default()).unwrap();
        let eval_out = eval.forward(input(&device), ForwardOptions::default()).unwrap();
        assert!(max_abs_diff(train_out.mlm_output.inner(), eval_out.mlm_output) < 1e-5);
    }
}
