// ============================================================
// Training Criteria
// ============================================================
// Masked losses used to train the expression heads. Every mask
// is a Bool tensor with the same shape as the prediction; true
// marks the entries that count.

use burn::prelude::*;

use crate::error::{ModelError, Result};

const PROB_EPS: f64 = 1e-7;
const RELATIVE_EPS: f64 = 1e-6;

/// Sum of squared errors over masked entries divided by the mask count.
pub fn masked_mse_loss<B: Backend, const D: usize>(
    input:  Tensor<B, D>,
    target: Tensor<B, D>,
    mask:   Tensor<B, D, Bool>,
) -> Tensor<B, 1> {
    let mask = mask.float();
    let sq_err = ((input - target) * mask.clone()).powf_scalar(2.0).sum();
    sq_err / mask.sum()
}

/// Negative Bernoulli log-likelihood of `target > 0` under `probs`,
/// averaged over the mask.
pub fn criterion_neg_log_bernoulli<B: Backend, const D: usize>(
    probs:  Tensor<B, D>,
    target: Tensor<B, D>,
    mask:   Tensor<B, D, Bool>,
) -> Tensor<B, 1> {
    let mask = mask.float();
    let probs = probs.clamp(PROB_EPS, 1.0 - PROB_EPS);
    let observed = target.greater_elem(0.0).float();

    let log_prob = observed.clone() * probs.clone().log()
        + observed.neg().add_scalar(1.0) * probs.neg().add_scalar(1.0).log();
    (log_prob * mask.clone()).sum().neg() / mask.sum()
}

/// Mean of `|input - target| / (target + 1e-6)` over masked entries.
pub fn masked_relative_error<B: Backend, const D: usize>(
    input:  Tensor<B, D>,
    target: Tensor<B, D>,
    mask:   Tensor<B, D, Bool>,
) -> Result<Tensor<B, 1>> {
    let count: f32 = mask.clone().float().sum().into_scalar().elem();
    if count == 0.0 {
        return Err(ModelError::EmptyMask);
    }
    // unmasked slots never enter the ratio, even when non-finite
    let unmasked = mask.bool_not();
    let input  = input.mask_fill(unmasked.clone(), 0.0);
    let target = target.mask_fill(unmasked, 0.0);
    let rel = (input - target.clone()).abs() / target.add_scalar(RELATIVE_EPS);
    Ok(rel.sum() / count)
}
