//! Layers Module - Building blocks of the GPT architecture
//!
//! - LayerNorm: layer normalization with optional bias
//! - CausalSelfAttention: masked multi-head attention with fused QKV projection
//! - Mlp: GELU feed-forward block

use candle_core::Result;
use candle_nn::{Init, Linear, VarBuilder};

pub mod attention;
pub mod layer_norm;
pub mod mlp;

pub use attention::CausalSelfAttention;
pub use layer_norm::LayerNorm;
pub use mlp::Mlp;

/// Standard deviation for weight initialization.
pub const INIT_STD: f64 = 0.02;

/// Linear layer in candle layout `[out, in]`, bias optional.
pub(crate) fn linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    Ok(Linear::new(weight, bias))
}
