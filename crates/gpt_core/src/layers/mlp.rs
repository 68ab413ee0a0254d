//! Mlp - GELU feed-forward block

use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use super::linear;
use crate::model::GptConfig;

/// Feed-forward block: expand 4x, GELU, project back.
#[derive(Clone)]
pub struct Mlp {
    pub c_fc: Linear,
    pub c_proj: Linear,
    pub dropout: Dropout,
}

impl Mlp {
    pub fn load(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = 4 * cfg.n_embd;
        let c_fc = linear(cfg.n_embd, hidden, cfg.bias, vb.pp("c_fc"))?;
        let c_proj = linear(hidden, cfg.n_embd, cfg.bias, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu_erf()?;
        let h = self.c_proj.forward(&h)?;
        self.dropout.forward(&h, train)
    }
}
