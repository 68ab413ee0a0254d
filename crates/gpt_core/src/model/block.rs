//! Block - Pre-norm transformer block (attention + MLP)

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::{CausalSelfAttention, LayerNorm, Mlp};
use crate::model::GptConfig;

/// Epsilon for LayerNorm
pub(crate) const LAYER_NORM_EPS: f64 = 1e-5;

/// Single transformer block with residual connections around attention and MLP
#[derive(Clone)]
pub struct Block {
    pub ln_1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln_2: LayerNorm,
    pub mlp: Mlp,
}

impl Block {
    pub fn load(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let ln_1 = LayerNorm::load(cfg.n_embd, cfg.bias, LAYER_NORM_EPS, vb.pp("ln_1"))?;
        let attn = CausalSelfAttention::load(cfg, vb.pp("attn"))?;
        let ln_2 = LayerNorm::load(cfg.n_embd, cfg.bias, LAYER_NORM_EPS, vb.pp("ln_2"))?;
        let mlp = Mlp::load(cfg, vb.pp("mlp"))?;

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let residual = x;
        let attn_out = self.attn.forward(&self.ln_1.forward(x)?, train)?;
        let x_mid = (residual + attn_out)?;

        let mlp_out = self.mlp.forward(&self.ln_2.forward(&x_mid)?, train)?;
        x_mid + mlp_out
    }
}
