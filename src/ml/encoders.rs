// ============================================================
// Token Embedding Branches
// ============================================================
// Each branch maps one view of a gene token to d_model:
//
//   GeneEncoder             gene id      → learned embedding
//   GenePtEncoder           gene id      → pretrained text embedding
//                                          projected to d_model
//   ContinuousValueEncoder  expression   → MLP embedding
//   PertEncoder             pert token   → embedding
//
// The model sums whichever branches the config enables.

use burn::{
    module::Param,
    nn::{
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        Initializer,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation,
};

use crate::domain::tables::EmbeddingTable;

/// Largest expression value the value encoder sees.
pub const MAX_VALUE: f32 = 512.0;

/// Uploads a host table as a trainable embedding.
fn embedding_from_table<B: Backend>(table: &EmbeddingTable, device: &B::Device) -> Embedding<B> {
    let weight = Tensor::<B, 1>::from_floats(table.values(), device)
        .reshape([table.rows(), table.dim()]);
    let mut embedding = EmbeddingConfig::new(table.rows(), table.dim()).init(device);
    embedding.weight = Param::from_tensor(weight);
    embedding
}

// ─── GeneEncoder ─────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct GeneEncoder<B: Backend> {
    pub embedding: Embedding<B>,
    pub enc_norm:  LayerNorm<B>,
}

impl<B: Backend> GeneEncoder<B> {
    pub fn new(ntoken: usize, d_model: usize, device: &B::Device) -> Self {
        let embedding = EmbeddingConfig::new(ntoken, d_model)
            .with_initializer(Initializer::Uniform { min: -0.1, max: 0.1 })
            .init(device);
        let enc_norm = LayerNormConfig::new(d_model).init(device);
        Self { embedding, enc_norm }
    }

    /// src: [batch, seq_len] → [batch, seq_len, d_model]
    pub fn forward(&self, src: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.enc_norm.forward(self.embedding.forward(src))
    }
}

// ─── GenePtEncoder ───────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct GenePtEncoder<B: Backend> {
    pub embedding: Embedding<B>,
    pub fc:        Linear<B>,
}

impl<B: Backend> GenePtEncoder<B> {
    /// `lookup` holds one pretrained row per vocab token.
    pub fn new(lookup: &EmbeddingTable, d_model: usize, device: &B::Device) -> Self {
        let embedding = embedding_from_table(lookup, device);
        let fc = LinearConfig::new(lookup.dim(), d_model).init(device);
        Self { embedding, fc }
    }

    pub fn forward(&self, src: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.fc.forward(self.embedding.forward(src))
    }
}

// ─── ContinuousValueEncoder ──────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct ContinuousValueEncoder<B: Backend> {
    pub linear1: Linear<B>,
    pub linear2: Linear<B>,
    pub norm:    LayerNorm<B>,
    pub dropout: Dropout,
}

impl<B: Backend> ContinuousValueEncoder<B> {
    pub fn new(d_model: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(1, d_model).init(device),
            linear2: LinearConfig::new(d_model, d_model).init(device),
            norm:    LayerNormConfig::new(d_model).init(device),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    /// values: [batch, seq_len] → [batch, seq_len, d_model]
    pub fn forward(&self, values: Tensor<B, 2>) -> Tensor<B, 3> {
        let x = values.unsqueeze_dim::<3>(2).clamp_max(MAX_VALUE);
        let x = activation::relu(self.linear1.forward(x));
        let x = self.norm.forward(self.linear2.forward(x));
        self.dropout.forward(x)
    }
}

// ─── PertEncoder ─────────────────────────────────────────────────────────────

/// Embeds the perturbation token of every gene.
///
/// In token mode the table is `n_pert_tokens × d_model` and the padding row
/// starts at zero. In drug mode the table holds pretrained perturbagen
/// vectors and `projection` maps them to d_model.
#[derive(Module, Debug)]
pub struct PertEncoder<B: Backend> {
    pub embedding:  Embedding<B>,
    pub projection: Option<Linear<B>>,
}

impl<B: Backend> PertEncoder<B> {
    pub fn tokens(n_tokens: usize, d_model: usize, pad_id: usize, device: &B::Device) -> Self {
        // pad row is only zero at init; it stays a trainable parameter
        let mut embedding = EmbeddingConfig::new(n_tokens, d_model).init(device);
        let weight = embedding.weight.val().slice_assign(
            [pad_id..pad_id + 1, 0..d_model],
            Tensor::zeros([1, d_model], device),
        );
        embedding.weight = Param::from_tensor(weight.detach());
        Self { embedding, projection: None }
    }

    pub fn drugs(table: &EmbeddingTable, d_model: usize, device: &B::Device) -> Self {
        Self {
            embedding:  embedding_from_table(table, device),
            projection: Some(LinearConfig::new(table.dim(), d_model).init(device)),
        }
    }

    pub fn forward(&self, pert_flags: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let x = self.embedding.forward(pert_flags);
        match &self.projection {
            Some(projection) => projection.forward(x),
            None => x,
        }
    }
}
