//! Seeded parameter initialization and stable parameter ordering.
//!
//! candle's CPU initializers are not seedable, so fresh models are
//! re-initialized here from a `StdRng`. Variables are visited in sorted
//! name order, which makes the result a pure function of `(config, seed)`.

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::layers::INIT_STD;
use crate::model::GptConfig;

/// All trainable variables of a `VarMap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// GPT-2 style init: N(0, 0.02) weights, residual projections scaled by
/// `1/sqrt(2 * n_layer)`, zero biases, unit LayerNorm gains.
pub fn init_weights(varmap: &VarMap, cfg: &GptConfig, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let proj_std = INIT_STD / (2.0 * cfg.n_layer as f64).sqrt();

    for (name, var) in named_vars(varmap) {
        let shape = var.shape().clone();
        let device = var.device().clone();

        let value = if name.ends_with(".bias") {
            Tensor::zeros(shape.clone(), var.dtype(), &device)?
        } else if name.contains("ln_") {
            Tensor::ones(shape.clone(), var.dtype(), &device)?
        } else {
            let std = if name.ends_with("c_proj.weight") {
                proj_std
            } else {
                INIT_STD
            };
            let normal = Normal::new(0.0f32, std as f32).map_err(candle_core::Error::wrap)?;
            let data: Vec<f32> = (0..shape.elem_count())
                .map(|_| normal.sample(&mut rng))
                .collect();
            Tensor::from_vec(data, shape.clone(), &device)?.to_dtype(var.dtype())?
        };
        var.set(&value)?;
    }
    Ok(())
}
