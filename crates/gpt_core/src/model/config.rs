//! GptConfig - Model shape configuration

use candle_core::Result;
use serde::{Deserialize, Serialize};

/// Shape of a GPT model. Everything needed to rebuild the parameter layout.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    pub vocab_size: usize,
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_bias")]
    pub bias: bool,
}

fn default_bias() -> bool {
    true
}

impl GptConfig {
    pub fn new(
        vocab_size: usize,
        block_size: usize,
        n_layer: usize,
        n_head: usize,
        n_embd: usize,
    ) -> Self {
        Self {
            vocab_size,
            block_size,
            n_layer,
            n_head,
            n_embd,
            dropout: 0.0,
            bias: true,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.block_size == 0 || self.n_layer == 0 {
            candle_core::bail!(
                "invalid model shape: vocab_size={}, block_size={}, n_layer={}",
                self.vocab_size,
                self.block_size,
                self.n_layer
            );
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            candle_core::bail!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd,
                self.n_head
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            candle_core::bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        Ok(())
    }

    /// Parameter count, counting the tied LM head once.
    pub fn num_params(&self) -> usize {
        let c = self.n_embd;
        let b = usize::from(self.bias);
        let ln = c + b * c;
        let attn = (c * 3 * c + b * 3 * c) + (c * c + b * c);
        let mlp = (c * 4 * c + b * 4 * c) + (4 * c * c + b * c);
        let per_layer = 2 * ln + attn + mlp;
        self.vocab_size * c + self.block_size * c + self.n_layer * per_layer + ln
    }

    /// Rough memory estimate in MB for weights, grads and AdamW moments.
    pub fn estimate_train_memory_mb(&self, batch_size: usize) -> f64 {
        // Weights (4) + Gradients (4) + Optimizer (8) = 16 bytes per param
        let model_bytes = self.num_params() as f64 * 16.0;
        let activation_bytes = (batch_size * self.block_size * self.n_embd * self.n_layer) as f64
            * 4.0
            * 12.0;
        (model_bytes + activation_bytes) / (1024.0 * 1024.0)
    }
}
