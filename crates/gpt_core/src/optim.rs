//! AdamW optimizer with decoupled weight decay and exportable moments.
//!
//! `candle_nn::AdamW` keeps its moments private, which makes exact resume
//! impossible. This implementation exposes the first/second moments and the
//! step counter so a checkpoint can carry the full optimizer state.

use candle_core::{Result, Tensor, Var};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamsAdamW {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdamW {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.99,
            eps: 1e-8,
            weight_decay: 0.1,
        }
    }
}

pub struct AdamW {
    vars: Vec<(String, Var)>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    step_t: usize,
    params: ParamsAdamW,
}

impl AdamW {
    /// `vars` must be in a stable order; gradients passed to `step` follow it.
    pub fn new(vars: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let mut m = Vec::with_capacity(vars.len());
        let mut v = Vec::with_capacity(vars.len());
        for (_, var) in &vars {
            m.push(var.zeros_like()?);
            v.push(var.zeros_like()?);
        }
        Ok(Self {
            vars,
            m,
            v,
            step_t: 0,
            params,
        })
    }

    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    /// One update. `grads[i]` is the gradient of `vars()[i]`.
    pub fn step(&mut self, grads: &[Tensor]) -> Result<()> {
        if grads.len() != self.vars.len() {
            candle_core::bail!(
                "expected {} gradients, got {}",
                self.vars.len(),
                grads.len()
            );
        }
        self.step_t += 1;

        let ParamsAdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let bias_c1 = 1.0 - beta1.powi(self.step_t as i32);
        let bias_c2 = 1.0 - beta2.powi(self.step_t as i32);

        for (i, (_, var)) in self.vars.iter().enumerate() {
            let g = &grads[i];
            let m = ((&self.m[i] * beta1)? + (g * (1.0 - beta1))?)?;
            let v = ((&self.v[i] * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m / bias_c1)?;
            let v_hat = (&v / bias_c2)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;

            // Decay matrices (weights, embeddings) only; gains and biases are left alone.
            let theta = var.as_tensor().detach();
            let theta = if theta.rank() >= 2 && weight_decay > 0.0 {
                (theta * (1.0 - lr * weight_decay))?
            } else {
                theta
            };
            var.set(&(theta - (update * lr)?)?)?;

            self.m[i] = m;
            self.v[i] = v;
        }
        Ok(())
    }

    /// First and second moments keyed by parameter name.
    pub fn moments(&self) -> impl Iterator<Item = (&str, &Tensor, &Tensor)> {
        self.vars
            .iter()
            .zip(self.m.iter().zip(self.v.iter()))
            .map(|((name, _), (m, v))| (name.as_str(), m, v))
    }

    /// Restore moments and the step counter. Every parameter must be present.
    pub fn load_state(
        &mut self,
        step_t: usize,
        m: &HashMap<String, Tensor>,
        v: &HashMap<String, Tensor>,
    ) -> Result<()> {
        for (i, (name, var)) in self.vars.iter().enumerate() {
            let (Some(mi), Some(vi)) = (m.get(name), v.get(name)) else {
                candle_core::bail!("missing optimizer state for '{name}'");
            };
            if mi.shape() != var.shape() || vi.shape() != var.shape() {
                candle_core::bail!(
                    "optimizer state for '{name}' has shape {:?}, expected {:?}",
                    mi.shape(),
                    var.shape()
                );
            }
            self.m[i] = mi.to_device(var.device())?;
            self.v[i] = vi.to_device(var.device())?;
        }
        self.step_t = step_t;
        Ok(())
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut [Tensor], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for g in grads.iter() {
        total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for g in grads.iter_mut() {
            *g = (&*g * scale)?;
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_adamw_moves_against_gradient() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::ones(4, DType::F32, &device)?)?;
        let mut opt = AdamW::new(
            vec![("w".to_string(), var.clone())],
            ParamsAdamW {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let grad = Tensor::new(&[1f32, -1.0, 0.5, 0.0], &device)?;
        opt.step(&[grad])?;

        let w = var.as_tensor().to_vec1::<f32>()?;
        assert!(w[0] < 1.0);
        assert!(w[1] > 1.0);
        assert!(w[2] < 1.0);
        assert!((w[3] - 1.0).abs() < 1e-6);
        assert_eq!(opt.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mut grads = vec![Tensor::new(&[3f32, 4.0], &device)?];
        let norm = clip_grad_norm(&mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);

        let clipped = grads[0].to_vec1::<f32>()?;
        let new_norm = (clipped[0] * clipped[0] + clipped[1] * clipped[1]).sqrt();
        assert!((new_norm - 1.0).abs() < 1e-4);
        Ok(())
    }
}
