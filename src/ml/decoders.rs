// ============================================================
// Decoder Heads
// ============================================================
//   ExprDecoder        per-gene scalar (+ zero probability)
//   AffineExprDecoder  pred = A(x) * values + b(x)
//   ClsDecoder         cell embedding → cell-type logits
//   MvcDecoder         cell embedding × gene embeddings →
//                      per-gene value (masked value consistency)

use burn::{
    module::Ignored,
    nn::{
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
        PRelu, PReluConfig,
    },
    prelude::*,
    tensor::activation,
};

use crate::ml::config::{DecoderActivation, MvcDecoderStyle};

const LEAKY_SLOPE: f64 = 0.01;
const QUERY_HIDDEN: usize = 64;

/// Per-gene prediction plus optional zero-inflation probability.
#[derive(Debug, Clone)]
pub struct HeadOutput<B: Backend> {
    /// [batch, seq_len]
    pub pred:       Tensor<B, 2>,
    /// [batch, seq_len], present when the head models zero inflation
    pub zero_probs: Option<Tensor<B, 2>>,
}

// ─── ExprDecoder ─────────────────────────────────────────────────────────────

/// Linear → LeakyReLU → Linear → LeakyReLU → Linear(1)
#[derive(Module, Debug)]
pub struct ScalarMlp<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub out: Linear<B>,
}

impl<B: Backend> ScalarMlp<B> {
    pub fn new(d_in: usize, d_model: usize, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(d_in, d_model).init(device),
            fc2: LinearConfig::new(d_model, d_model).init(device),
            out: LinearConfig::new(d_model, 1).init(device),
        }
    }

    /// x: [batch, seq_len, d_in] → [batch, seq_len]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, seq_len, _] = x.dims();
        let x = activation::leaky_relu(self.fc1.forward(x), LEAKY_SLOPE);
        let x = activation::leaky_relu(self.fc2.forward(x), LEAKY_SLOPE);
        self.out.forward(x).reshape([batch, seq_len])
    }
}

#[derive(Module, Debug)]
pub struct ExprDecoder<B: Backend> {
    pub fc:         ScalarMlp<B>,
    pub zero_logit: Option<ScalarMlp<B>>,
}

impl<B: Backend> ExprDecoder<B> {
    pub fn new(d_model: usize, explicit_zero_prob: bool, device: &B::Device) -> Self {
        Self {
            fc:         ScalarMlp::new(d_model, d_model, device),
            zero_logit: explicit_zero_prob.then(|| ScalarMlp::new(d_model, d_model, device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> HeadOutput<B> {
        let zero_probs = self
            .zero_logit
            .as_ref()
            .map(|mlp| activation::sigmoid(mlp.forward(x.clone())));
        HeadOutput { pred: self.fc.forward(x), zero_probs }
    }
}

// ─── AffineExprDecoder ───────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct AffineExprDecoder<B: Backend> {
    pub coeff_decoder: ExprDecoder<B>,
    pub bias_decoder:  ExprDecoder<B>,
    pub activation:    Ignored<Option<DecoderActivation>>,
    pub adaptive_bias: bool,
}

impl<B: Backend> AffineExprDecoder<B> {
    pub fn new(
        d_model:            usize,
        explicit_zero_prob: bool,
        activation:         Option<DecoderActivation>,
        adaptive_bias:      bool,
        device:             &B::Device,
    ) -> Self {
        Self {
            coeff_decoder: ExprDecoder::new(d_model, explicit_zero_prob, device),
            bias_decoder:  ExprDecoder::new(d_model, explicit_zero_prob, device),
            activation:    Ignored(activation),
            adaptive_bias,
        }
    }

    /// x: [batch, seq_len, d_model], values: [batch, seq_len]
    pub fn forward(&self, x: Tensor<B, 3>, values: Tensor<B, 2>) -> HeadOutput<B> {
        let coeff = self.coeff_decoder.forward(x.clone());
        let bias  = self.bias_decoder.forward(x);

        let (mut a, mut b) = (coeff.pred, bias.pred);
        if let Some(act) = self.activation.0 {
            a = act.apply(a);
            b = act.apply(b);
        }

        if self.adaptive_bias {
            // mean over the non-zero inputs of each cell; all-zero cells count as one
            let non_zero = values.clone().not_equal_elem(0.0).float().sum_dim(1).clamp_min(1.0);
            let mean = values.clone().sum_dim(1) / non_zero;
            b = b * mean;
        }

        HeadOutput { pred: a * values + b, zero_probs: coeff.zero_probs }
    }
}

// ─── ClsDecoder ──────────────────────────────────────────────────────────────

#[derive(Module, Debug)]
pub struct ClsBlock<B: Backend> {
    pub linear: Linear<B>,
    pub norm:   LayerNorm<B>,
}

#[derive(Module, Debug)]
pub struct ClsDecoder<B: Backend> {
    pub blocks:    Vec<ClsBlock<B>>,
    pub out_layer: Linear<B>,
}

impl<B: Backend> ClsDecoder<B> {
    /// `nlayers` counts the output layer, so `nlayers - 1` hidden blocks.
    pub fn new(d_model: usize, n_cls: usize, nlayers: usize, device: &B::Device) -> Self {
        let blocks = (0..nlayers.saturating_sub(1))
            .map(|_| ClsBlock {
                linear: LinearConfig::new(d_model, d_model).init(device),
                norm:   LayerNormConfig::new(d_model).init(device),
            })
            .collect();
        Self { blocks, out_layer: LinearConfig::new(d_model, n_cls).init(device) }
    }

    /// cell_emb: [batch, d_model] → [batch, n_cls]
    pub fn forward(&self, cell_emb: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(cell_emb, |x, block| {
            block.norm.forward(activation::relu(block.linear.forward(x)))
        });
        self.out_layer.forward(x)
    }
}

// ─── MvcDecoder ──────────────────────────────────────────────────────────────

/// Predicts each gene's value from the cell embedding queried by the gene's
/// token embedding.
///
/// * inner product: `pred = W(sigmoid(q(gene))) · cell`
/// * concat query:  `pred = fc2(prelu(fc1([cell, sigmoid(q(gene))])))`
/// * sum query:     `pred = fc2(prelu(fc1(cell + sigmoid(q(gene)))))`
///
/// Exactly one of `inner` / `query` is present.
#[derive(Module, Debug)]
pub struct MvcDecoder<B: Backend> {
    pub gene2query: Linear<B>,
    pub inner:      Option<InnerProductHead<B>>,
    pub query:      Option<QueryHead<B>>,
    pub style:      Ignored<MvcDecoderStyle>,
}

#[derive(Module, Debug)]
pub struct InnerProductHead<B: Backend> {
    pub w:            Linear<B>,
    pub w_zero_logit: Option<Linear<B>>,
}

#[derive(Module, Debug)]
pub struct QueryHead<B: Backend> {
    pub fc1:        Linear<B>,
    pub hidden_act: PRelu<B>,
    pub fc2:        Linear<B>,
}

impl<B: Backend> MvcDecoder<B> {
    pub fn new(
        d_model:            usize,
        style:              MvcDecoderStyle,
        explicit_zero_prob: bool,
        device:             &B::Device,
    ) -> Self {
        let linear = |d_in: usize, d_out: usize| -> Linear<B> {
            LinearConfig::new(d_in, d_out).init(device)
        };
        let query_head = |d_in: usize| QueryHead::<B> {
            fc1:        linear(d_in, QUERY_HIDDEN),
            hidden_act: PReluConfig::new().init(device),
            fc2:        linear(QUERY_HIDDEN, 1),
        };
        let (gene2query, inner, query) = match style {
            MvcDecoderStyle::InnerProduct | MvcDecoderStyle::InnerProductDetach => {
                let head = InnerProductHead {
                    w:            LinearConfig::new(d_model, d_model).with_bias(false).init(device),
                    w_zero_logit: explicit_zero_prob.then(|| linear(d_model, d_model)),
                };
                (linear(d_model, d_model), Some(head), None)
            }
            MvcDecoderStyle::ConcatQuery => {
                (linear(d_model, QUERY_HIDDEN), None, Some(query_head(d_model + QUERY_HIDDEN)))
            }
            MvcDecoderStyle::SumQuery => {
                (linear(d_model, d_model), None, Some(query_head(d_model)))
            }
        };
        Self { gene2query, inner, query, style: Ignored(style) }
    }

    /// cell_emb: [batch, d_model], gene_embs: [batch, seq_len, d_model]
    pub fn forward(&self, cell_emb: Tensor<B, 2>, gene_embs: Tensor<B, 3>) -> HeadOutput<B> {
        let gene_embs = match self.style.0 {
            MvcDecoderStyle::InnerProductDetach => gene_embs.detach(),
            _ => gene_embs,
        };
        let [batch, seq_len, d_model] = gene_embs.dims();
        let query = activation::sigmoid(self.gene2query.forward(gene_embs));

        match (&self.inner, &self.query) {
            (Some(inner), _) => {
                let cell = cell_emb.unsqueeze_dim::<3>(2); // [batch, d_model, 1]
                let pred = inner.w.forward(query.clone())
                    .matmul(cell.clone())
                    .reshape([batch, seq_len]);
                let zero_probs = inner.w_zero_logit.as_ref().map(|w_zero| {
                    let logits = w_zero.forward(query).matmul(cell).reshape([batch, seq_len]);
                    activation::sigmoid(logits)
                });
                HeadOutput { pred, zero_probs }
            }
            (None, Some(head)) => {
                let cell = cell_emb.unsqueeze_dim::<3>(1); // [batch, 1, d_model]
                let hidden_in = match self.style.0 {
                    MvcDecoderStyle::ConcatQuery => {
                        Tensor::cat(vec![cell.expand([batch, seq_len, d_model]), query], 2)
                    }
                    _ => cell + query,
                };
                let hidden = head.hidden_act.forward(head.fc1.forward(hidden_in));
                let pred = head.fc2.forward(hidden).reshape([batch, seq_len]);
                HeadOutput { pred, zero_probs: None }
            }
            (None, None) => unreachable!("MvcDecoder is always built with one head"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    fn hidden(batch: usize, seq_len: usize, d: usize) -> Tensor<B, 3> {
        Tensor::random([batch, seq_len, d], Distribution::Default, &Default::default())
    }

    #[test]
    fn test_expr_decoder_zero_probs_in_unit_interval() {
        let device = Default::default();
        let out = ExprDecoder::<B>::new(8, true, &device).forward(hidden(2, 4, 8));
        assert_eq!(out.pred.dims(), [2, 4]);
        let probs: Vec<f32> = out.zero_probs.unwrap().into_data().to_vec().unwrap();
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

        let plain = ExprDecoder::<B>::new(8, false, &device).forward(hidden(2, 4, 8));
        assert!(plain.zero_probs.is_none());
    }

    #[test]
    fn test_affine_decoder_is_affine_in_values() {
        let device = Default::default();
        let decoder = AffineExprDecoder::<B>::new(8, false, None, false, &device);
        let x = hidden(1, 3, 8);
        let zeros = Tensor::<B, 2>::zeros([1, 3], &device);
        let ones  = Tensor::<B, 2>::ones([1, 3], &device);
        let twos  = ones.clone() * 2.0;

        let p0 = decoder.forward(x.clone(), zeros).pred;
        let p1 = decoder.forward(x.clone(), ones).pred;
        let p2 = decoder.forward(x, twos).pred;
        // (p2 - p1) == (p1 - p0) == A
        let diff: f32 = ((p2 - p1.clone()) - (p1 - p0)).abs().max().into_scalar().elem();
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_adaptive_bias_scales_with_non_zero_mean() {
        let device = Default::default();
        let decoder = AffineExprDecoder::<B>::new(8, false, None, true, &device);
        let x = hidden(1, 4, 8);
        let all_zero = decoder.forward(x.clone(), Tensor::zeros([1, 4], &device)).pred;
        // no non-zero inputs → bias scaled by 0, prediction vanishes
        let total: f32 = all_zero.abs().sum().into_scalar().elem();
        assert!(total < 1e-6);
    }

    #[test]
    fn test_cls_decoder_depth_and_shape() {
        let device = Default::default();
        let decoder = ClsDecoder::<B>::new(8, 5, 3, &device);
        assert_eq!(decoder.blocks.len(), 2);
        let cell = Tensor::<B, 2>::random([4, 8], Distribution::Default, &device);
        assert_eq!(decoder.forward(cell).dims(), [4, 5]);
        assert!(ClsDecoder::<B>::new(8, 5, 1, &device).blocks.is_empty());
    }

    #[test]
    fn test_mvc_styles_produce_per_gene_values() {
        let device = Default::default();
        let cell = Tensor::<B, 2>::random([2, 8], Distribution::Default, &device);
        for style in [
            MvcDecoderStyle::InnerProduct,
            MvcDecoderStyle::InnerProductDetach,
            MvcDecoderStyle::ConcatQuery,
            MvcDecoderStyle::SumQuery,
        ] {
            let decoder = MvcDecoder::<B>::new(8, style, false, &device);
            let out = decoder.forward(cell.clone(), hidden(2, 5, 8));
            assert_eq!(out.pred.dims(), [2, 5], "{style:?}");
            assert!(out.zero_probs.is_none());
        }
    }

    #[test]
    fn test_mvc_inner_product_zero_probs() {
        let device = Default::default();
        let cell = Tensor::<B, 2>::random([2, 8], Distribution::Default, &device);
        let decoder = MvcDecoder::<B>::new(8, MvcDecoderStyle::InnerProduct, true, &device);
        let out = decoder.forward(cell, hidden(2, 5, 8));
        assert_eq!(out.zero_probs.unwrap().dims(), [2, 5]);
    }
}
