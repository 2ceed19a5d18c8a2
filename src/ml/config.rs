// ============================================================
// Model Configuration
// ============================================================
// Every hyperparameter of the generator lives here. The struct
// derives burn's `Config`, so it serialises to JSON with
// `save(path)` / `ScGenePtConfig::load(path)` and gets a
// builder (`with_dropout`, `with_do_mvc`, ...) for free.
//
// The string options accepted by the upstream model
// ("avg-pool", "inner product", "LeakyReLU", ...) are typed
// enums here; `FromStr` accepts exactly those spellings.

use std::{fmt, str::FromStr};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Input branches summed into the token embedding.
///
/// The perturbation embedding is always added and is not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingBranch {
    /// Continuous expression-value embedding.
    #[serde(rename = "scGPT_counts_embs")]
    GeneCounts,
    /// Learned gene-identity embedding.
    #[serde(rename = "scGPT_token_embs")]
    GeneTokens,
    /// Gene embedding projected from pretrained text embeddings.
    #[serde(rename = "genePT_token_embs")]
    GenePtTokens,
}

impl EmbeddingBranch {
    pub const ALL: [EmbeddingBranch; 3] = [
        EmbeddingBranch::GeneCounts,
        EmbeddingBranch::GeneTokens,
        EmbeddingBranch::GenePtTokens,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneCounts   => "scGPT_counts_embs",
            Self::GeneTokens   => "scGPT_token_embs",
            Self::GenePtTokens => "genePT_token_embs",
        }
    }
}

impl FromStr for EmbeddingBranch {
    type Err = ModelError;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| ModelError::UnknownOption { kind: "embedding branch", value: s.to_string() })
    }
}

impl fmt::Display for EmbeddingBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the per-gene encoder output is pooled into one cell embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CellEmbStyle {
    /// Output at the first position.
    #[default]
    #[serde(rename = "cls")]
    Cls,
    /// Mean over the sequence.
    #[serde(rename = "avg-pool")]
    AvgPool,
    /// Sum weighted by the input values, then L2-normalised.
    #[serde(rename = "w-pool")]
    WPool,
}

impl FromStr for CellEmbStyle {
    type Err = ModelError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "cls"      => Ok(Self::Cls),
            "avg-pool" => Ok(Self::AvgPool),
            "w-pool"   => Ok(Self::WPool),
            other      => Err(ModelError::UnknownOption {
                kind:  "cell_emb_style",
                value: other.to_string(),
            }),
        }
    }
}

/// Architecture of the masked-value-consistency head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MvcDecoderStyle {
    #[default]
    #[serde(rename = "inner product")]
    InnerProduct,
    /// Inner product with gradients stopped at the gene embeddings.
    #[serde(rename = "inner product, detach")]
    InnerProductDetach,
    #[serde(rename = "concat query")]
    ConcatQuery,
    #[serde(rename = "sum query")]
    SumQuery,
}

impl MvcDecoderStyle {
    pub fn is_inner_product(&self) -> bool {
        matches!(self, Self::InnerProduct | Self::InnerProductDetach)
    }
}

impl FromStr for MvcDecoderStyle {
    type Err = ModelError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "inner product"         => Ok(Self::InnerProduct),
            "inner product, detach" => Ok(Self::InnerProductDetach),
            "concat query"          => Ok(Self::ConcatQuery),
            "sum query"             => Ok(Self::SumQuery),
            other                   => Err(ModelError::UnknownOption {
                kind:  "mvc_decoder_style",
                value: other.to_string(),
            }),
        }
    }
}

/// Activation applied to the affine decoder's coefficient and bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderActivation {
    #[serde(rename = "ReLU")]
    Relu,
    #[serde(rename = "Sigmoid")]
    Sigmoid,
    #[serde(rename = "Tanh")]
    Tanh,
    #[serde(rename = "GELU")]
    Gelu,
    #[serde(rename = "LeakyReLU")]
    LeakyRelu,
    #[serde(rename = "Softplus")]
    Softplus,
}

impl DecoderActivation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        use burn::tensor::activation;
        match self {
            Self::Relu      => activation::relu(x),
            Self::Sigmoid   => activation::sigmoid(x),
            Self::Tanh      => activation::tanh(x),
            Self::Gelu      => activation::gelu(x),
            Self::LeakyRelu => activation::leaky_relu(x, 0.01),
            Self::Softplus  => activation::softplus(x, 1.0),
        }
    }
}

impl FromStr for DecoderActivation {
    type Err = ModelError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ReLU"      => Ok(Self::Relu),
            "Sigmoid"   => Ok(Self::Sigmoid),
            "Tanh"      => Ok(Self::Tanh),
            "GELU"      => Ok(Self::Gelu),
            "LeakyReLU" => Ok(Self::LeakyRelu),
            "Softplus"  => Ok(Self::Softplus),
            other       => Err(ModelError::UnknownOption {
                kind:  "decoder activation",
                value: other.to_string(),
            }),
        }
    }
}

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct ScGenePtConfig {
    /// Vocabulary size (number of gene tokens).
    pub ntoken:      usize,
    pub d_model:     usize,
    pub nhead:       usize,
    /// Hidden size of the encoder feed-forward block.
    pub d_hid:       usize,
    pub nlayers:     usize,
    /// Depth of the cell-type classifier (last layer included).
    pub nlayers_cls: usize,
    /// Number of cell-type classes.
    pub n_cls:       usize,

    #[config(default = 0.5)]
    pub dropout: f64,
    #[config(default = 0)]
    pub pad_token_id: usize,
    #[config(default = 0.0)]
    pub pad_value: f64,
    /// Perturbation token used for padded positions.
    #[config(default = 2)]
    pub pert_pad_id: usize,
    /// Size of the perturbation vocabulary when drug embeddings are off.
    #[config(default = 3)]
    pub n_pert_tokens: usize,
    #[config(default = false)]
    pub do_mvc: bool,
    /// Bins applied to input values before encoding, 0 disables binning.
    #[config(default = 0)]
    pub n_input_bins: usize,
    #[config(default = "CellEmbStyle::Cls")]
    pub cell_emb_style: CellEmbStyle,
    #[config(default = "MvcDecoderStyle::InnerProduct")]
    pub mvc_decoder_style: MvcDecoderStyle,
    pub decoder_activation: Option<DecoderActivation>,
    #[config(default = false)]
    pub decoder_adaptive_bias: bool,
    #[config(default = 0.3)]
    pub ecs_threshold: f64,
    #[config(default = false)]
    pub explicit_zero_prob: bool,
    #[config(default = false)]
    pub use_fast_transformer: bool,
    #[config(default = false)]
    pub pre_norm: bool,
    #[config(default = "EmbeddingBranch::ALL.to_vec()")]
    pub embs_to_include: Vec<EmbeddingBranch>,
    #[config(default = false)]
    pub use_drug_embeds: bool,
    /// Width of the pretrained GenePT and drug embedding tables.
    #[config(default = 1536)]
    pub genept_embs_size: usize,
    /// Temperature of the contrastive cell-embedding similarity.
    #[config(default = 0.5)]
    pub cce_temperature: f64,
}

impl ScGenePtConfig {
    pub fn includes(&self, branch: EmbeddingBranch) -> bool {
        self.embs_to_include.contains(&branch)
    }

    /// True when at least one gene-token branch feeds the MVC head.
    pub fn has_gene_token_branch(&self) -> bool {
        self.includes(EmbeddingBranch::GeneTokens) || self.includes(EmbeddingBranch::GenePtTokens)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(ModelError::InvalidConfig(msg));

        for (name, value) in [
            ("ntoken", self.ntoken),
            ("d_model", self.d_model),
            ("nhead", self.nhead),
            ("d_hid", self.d_hid),
            ("nlayers_cls", self.nlayers_cls),
            ("n_cls", self.n_cls),
            ("genept_embs_size", self.genept_embs_size),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be positive"));
            }
        }
        if self.d_model % self.nhead != 0 {
            return invalid(format!(
                "d_model ({}) must be divisible by nhead ({})",
                self.d_model, self.nhead
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if !self.ecs_threshold.is_finite() {
            return invalid("ecs_threshold must be finite".to_string());
        }
        if self.cce_temperature <= 0.0 {
            return invalid(format!("cce_temperature must be positive, got {}", self.cce_temperature));
        }
        if self.pad_token_id >= self.ntoken {
            return invalid(format!(
                "pad_token_id ({}) outside a vocabulary of {}",
                self.pad_token_id, self.ntoken
            ));
        }
        if !self.use_drug_embeds && self.pert_pad_id >= self.n_pert_tokens {
            return invalid(format!(
                "pert_pad_id ({}) outside {} perturbation tokens",
                self.pert_pad_id, self.n_pert_tokens
            ));
        }
        if self.n_input_bins > 0 && self.n_input_bins < 3 {
            return invalid(format!("n_input_bins must be 0 or at least 3, got {}", self.n_input_bins));
        }
        if self.do_mvc {
            if self.explicit_zero_prob && !self.mvc_decoder_style.is_inner_product() {
                return invalid(format!(
                    "{:?} MVC decoder does not predict zero probabilities",
                    self.mvc_decoder_style
                ));
            }
            if !self.has_gene_token_branch() {
                return invalid("MVC decoder needs a gene token embedding branch".to_string());
            }
        }
        Ok(())
    }
}
