// ============================================================
// Transformer Encoder
// ============================================================
// nlayers identical blocks of
//
//   post-norm (default)                 pre-norm
//   x = norm1(x + drop(attn(x)))        x = x + drop(attn(norm1(x)))
//   x = norm2(x + drop(ffn(x)))         x = x + drop(ffn(norm2(x)))
//
// with ffn = linear2(drop(relu(linear1(x)))). Padded genes are
// excluded as attention keys through the padding mask.

use burn::{
    nn::{
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
        Dropout, DropoutConfig,
        LayerNorm, LayerNormConfig,
        Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation,
};

#[derive(Config, Debug)]
pub struct GeneTransformerConfig {
    pub d_model: usize,
    pub nhead:   usize,
    pub d_hid:   usize,
    pub nlayers: usize,
    #[config(default = 0.5)]
    pub dropout: f64,
    #[config(default = false)]
    pub pre_norm: bool,
}

impl GeneTransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GeneTransformer<B> {
        let layers = (0..self.nlayers)
            .map(|_| self.build_encoder_block(device))
            .collect();
        GeneTransformer { layers }
    }

    fn build_encoder_block<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        let self_attn   = MultiHeadAttentionConfig::new(self.d_model, self.nhead)
            .with_dropout(self.dropout)
            .init(device);
        let ffn_linear1 = LinearConfig::new(self.d_model, self.d_hid).init(device);
        let ffn_linear2 = LinearConfig::new(self.d_hid, self.d_model).init(device);
        let norm1   = LayerNormConfig::new(self.d_model).init(device);
        let norm2   = LayerNormConfig::new(self.d_model).init(device);
        let dropout = DropoutConfig::new(self.dropout).init();
        EncoderBlock {
            self_attn, ffn_linear1, ffn_linear2, norm1, norm2, dropout,
            pre_norm: self.pre_norm,
        }
    }
}

#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub self_attn:   MultiHeadAttention<B>,
    pub ffn_linear1: Linear<B>,
    pub ffn_linear2: Linear<B>,
    pub norm1:       LayerNorm<B>,
    pub norm2:       LayerNorm<B>,
    pub dropout:     Dropout,
    pub pre_norm:    bool,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>, padding_mask: Option<Tensor<B, 2, Bool>>) -> Tensor<B, 3> {
        if self.pre_norm {
            let attn = self.attend(self.norm1.forward(x.clone()), padding_mask);
            let x = x + self.dropout.forward(attn);
            let ffn = self.feed_forward(self.norm2.forward(x.clone()));
            x + self.dropout.forward(ffn)
        } else {
            let attn = self.attend(x.clone(), padding_mask);
            let x = self.norm1.forward(x + self.dropout.forward(attn));
            let ffn = self.feed_forward(x.clone());
            self.norm2.forward(x + self.dropout.forward(ffn))
        }
    }

    fn attend(&self, x: Tensor<B, 3>, padding_mask: Option<Tensor<B, 2, Bool>>) -> Tensor<B, 3> {
        let input = match padding_mask {
            Some(mask) => MhaInput::self_attn(x).mask_pad(mask),
            None => MhaInput::self_attn(x),
        };
        self.self_attn.forward(input).context
    }

    fn feed_forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = self.dropout.forward(activation::relu(self.ffn_linear1.forward(x)));
        self.ffn_linear2.forward(hidden)
    }
}

#[derive(Module, Debug)]
pub struct GeneTransformer<B: Backend> {
    pub layers: Vec<EncoderBlock<B>>,
}

impl<B: Backend> GeneTransformer<B> {
    /// x: [batch, seq_len, d_model], padding_mask: [batch, seq_len] (true = pad)
    pub fn forward(&self, x: Tensor<B, 3>, padding_mask: Option<Tensor<B, 2, Bool>>) -> Tensor<B, 3> {
        self.layers
            .iter()
            .fold(x, |x, layer| layer.forward(x, padding_mask.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray;

    #[test]
    fn test_output_shape_for_both_norm_schemes() {
        let device = Default::default();
        let x = Tensor::<B, 3>::random([2, 5, 8], Distribution::Default, &device);
        for pre_norm in [false, true] {
            let encoder = GeneTransformerConfig::new(8, 2, 16, 2)
                .with_pre_norm(pre_norm)
                .init::<B>(&device);
            assert_eq!(encoder.layers.len(), 2);
            assert_eq!(encoder.forward(x.clone(), None).dims(), [2, 5, 8]);
        }
    }

    #[test]
    fn test_padded_keys_do_not_change_real_tokens() {
        let device = Default::default();
        let encoder = GeneTransformerConfig::new(8, 2, 16, 1).init::<B>(&device);

        let real  = Tensor::<B, 3>::random([1, 3, 8], Distribution::Default, &device);
        let pad_a = Tensor::<B, 3>::zeros([1, 2, 8], &device);
        let pad_b = Tensor::<B, 3>::ones([1, 2, 8], &device);
        let mask  = Tensor::<B, 1, Int>::from_ints([0, 0, 0, 1, 1], &device)
            .reshape([1, 5])
            .equal_elem(1);

        let out_a = encoder.forward(Tensor::cat(vec![real.clone(), pad_a], 1), Some(mask.clone()));
        let out_b = encoder.forward(Tensor::cat(vec![real, pad_b], 1), Some(mask));

        let diff: f32 = (out_a.slice([0..1, 0..3, 0..8]) - out_b.slice([0..1, 0..3, 0..8]))
            .abs()
            .max()
            .into_scalar()
            .elem();
        assert!(diff < 1e-4, "padded keys leaked into real tokens: {diff}");
    }
}
