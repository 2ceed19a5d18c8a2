// ============================================================
// Cell-Embedding Regularizers
// ============================================================
//   ECS  elastic cell similarity: pushes the positive cosine
//        similarity between different cells towards a threshold
//   CCE  contrastive cell embedding: two dropout-perturbed views
//        of the same cell should match each other and nothing
//        else in the batch

use burn::{
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::activation,
};

const NORM_EPS: f64 = 1e-12;

/// Rows scaled to unit L2 norm.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORM_EPS);
    x / norm
}

/// Boolean identity matrix.
fn eye_mask<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2, Bool> {
    let idx  = Tensor::<B, 1, Int>::arange(0..n as i64, device);
    let rows = idx.clone().reshape([n, 1]).expand([n, n]);
    let cols = idx.reshape([1, n]).expand([n, n]);
    rows.equal(cols)
}

/// Cosine similarity scaled by a temperature.
#[derive(Debug, Clone, Copy)]
pub struct Similarity {
    pub temperature: f64,
}

impl Similarity {
    pub fn new(temperature: f64) -> Self {
        Self { temperature }
    }

    /// a: [n, d], b: [m, d] → [n, m] pairwise similarities
    pub fn pairwise<B: Backend>(&self, a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
        l2_normalize(a).matmul(l2_normalize(b).transpose()) / self.temperature
    }
}

/// `mean(1 - (relu(cos_ij) - threshold)^2)` over all pairs with the
/// diagonal zeroed before the ReLU.
pub fn elastic_cell_similarity<B: Backend>(cell_emb: Tensor<B, 2>, threshold: f64) -> Tensor<B, 1> {
    let [n, _] = cell_emb.dims();
    let normed = l2_normalize(cell_emb);
    let cos_sim = normed.clone().matmul(normed.transpose());
    let cos_sim = cos_sim.clone().mask_fill(eye_mask::<B>(n, &cos_sim.device()), 0.0);
    let cos_sim = activation::relu(cos_sim);

    (cos_sim - threshold).powf_scalar(2.0).neg().add_scalar(1.0).mean()
}

/// Cross entropy of the `[n, n]` similarity between two views against the
/// diagonal.
pub fn contrastive_cell_loss<B: Backend>(
    view1:      Tensor<B, 2>,
    view2:      Tensor<B, 2>,
    similarity: Similarity,
) -> Tensor<B, 1> {
    let [n, _] = view1.dims();
    let device = view1.device();
    let logits = similarity.pairwise(view1, view2);
    let labels = Tensor::<B, 1, Int>::arange(0..n as i64, &device);
    CrossEntropyLossConfig::new().init(&device).forward(logits, labels)
}
