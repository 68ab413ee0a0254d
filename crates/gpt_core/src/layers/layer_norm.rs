//! LayerNorm - Layer normalization built from differentiable tensor ops

use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Layer normalization over the last dimension.
#[derive(Clone)]
pub struct LayerNorm {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub eps: f64,
}

impl LayerNorm {
    pub fn load(dim: usize, bias: bool, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = if bias {
            Some(vb.get_with_hints(dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let dim = x.rank() - 1;
        let hidden_size = x.dim(dim)?;

        let mean = (x.sum_keepdim(dim)? / hidden_size as f64)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(dim)? / hidden_size as f64)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;

        let out = normed.broadcast_mul(&self.weight)?;
        let out = match &self.bias {
            Some(b) => out.broadcast_add(b)?,
            None => out,
        };
        out.to_dtype(x_dtype)
    }
}
