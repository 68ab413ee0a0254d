use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{ops::softmax, Dropout, Linear, VarBuilder};

use super::linear;
use crate::model::GptConfig;

/// Multi-head causal self-attention with a fused QKV projection (`c_attn`).
#[derive(Clone)]
pub struct CausalSelfAttention {
    pub c_attn: Linear,
    pub c_proj: Linear,
    pub attn_dropout: Dropout,
    pub resid_dropout: Dropout,
    pub n_head: usize,
    pub n_embd: usize,
    pub scaling: f64,
    /// Additive mask `[block_size, block_size]`: 0 on and below the diagonal, -inf above.
    pub mask: Tensor,
}

impl CausalSelfAttention {
    pub fn load(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let c_attn = linear(cfg.n_embd, 3 * cfg.n_embd, cfg.bias, vb.pp("c_attn"))?;
        let c_proj = linear(cfg.n_embd, cfg.n_embd, cfg.bias, vb.pp("c_proj"))?;
        let mask = causal_mask(cfg.block_size, vb.device())?;

        Ok(Self {
            c_attn,
            c_proj,
            attn_dropout: Dropout::new(cfg.dropout),
            resid_dropout: Dropout::new(cfg.dropout),
            n_head: cfg.n_head,
            n_embd: cfg.n_embd,
            scaling: 1.0 / (cfg.head_dim() as f64).sqrt(),
            mask,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b_sz, seq_len, hidden) = x.dims3()?;
        let head_dim = hidden / self.n_head;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            qkv.narrow(2, i * self.n_embd, self.n_embd)?
                .reshape((b_sz, seq_len, self.n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        // [B, H, T, T]
        let att = (q.matmul(&k.t()?.contiguous()?)? * self.scaling)?;
        let mask = self.mask.narrow(0, 0, seq_len)?.narrow(1, 0, seq_len)?;
        let att = att.broadcast_add(&mask)?;
        let att = softmax(&att, D::Minus1)?;
        let att = self.attn_dropout.forward(&att, train)?;

        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, hidden))?;
        let y = self.c_proj.forward(&y)?;
        self.resid_dropout.forward(&y, train)
    }
}

fn causal_mask(size: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..size)
        .flat_map(|i| (0..size).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Tensor::from_vec(mask, (size, size), device)
}
