// ============================================================
// ML / Model Layer (Burn)
// ============================================================
// All burn-specific code lives in this layer. The domain layer
// hands it plain Rust data; everything here is generic over
// `B: Backend` so the same model runs on NdArray, Wgpu or an
// Autodiff wrapper of either.
//
//   config.rs        hyperparameters and typed options
//   encoders.rs      gene / GenePT / value / perturbation branches
//   transformer.rs   encoder stack with padding mask
//   decoders.rs      expression, classification and MVC heads
//   regularizers.rs  ECS and CCE cell-embedding losses
//   model.rs         the generator wiring all of the above
//   predictor.rs     perturbation prediction on host batches
//   loss.rs          masked training criteria

pub mod config;
pub mod encoders;
pub mod transformer;
pub mod decoders;
pub mod regularizers;
pub mod model;
pub mod predictor;
pub mod loss;
