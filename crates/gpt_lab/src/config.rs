//! Training hyperparameters, presets and config-file loading.

use std::path::Path;
use std::str::FromStr;

use gpt_core::{GptConfig, LrSchedule, ParamsAdamW};
use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// How the model parameters of a run are obtained.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum InitMode {
    #[default]
    Scratch,
    Resume,
    /// GPT-2 layout weights from a local directory or a hub repo id.
    Pretrained { source: String },
}

impl FromStr for InitMode {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(LabError::InvalidConfig("empty init_from".to_string())),
            "scratch" => Ok(Self::Scratch),
            "resume" => Ok(Self::Resume),
            other => Ok(Self::Pretrained {
                source: other.to_string(),
            }),
        }
    }
}

/// Full hyperparameter set of a run. Embedded verbatim into every checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    // Model shape
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub block_size: usize,
    pub dropout: f32,
    pub bias: bool,

    // Optimizer & schedule
    pub learning_rate: f64,
    pub min_lr: f64,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub decay_lr: bool,
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub grad_clip: f64,

    // Batching & workers
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub num_workers: usize,

    // Loop control
    pub max_iters: usize,
    pub eval_interval: usize,
    pub eval_iters: usize,
    pub log_interval: usize,
    pub save_interval: usize,
    pub always_save_checkpoint: bool,
    pub seed: u64,
    pub init_from: InitMode,
}

impl Default for TrainConfig {
    fn default() -> Self {
        // Small character-level GPT.
        Self {
            n_layer: 6,
            n_head: 6,
            n_embd: 384,
            block_size: 256,
            dropout: 0.2,
            bias: false,
            learning_rate: 1e-3,
            min_lr: 1e-4,
            warmup_iters: 100,
            lr_decay_iters: 5000,
            decay_lr: true,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.99,
            grad_clip: 1.0,
            batch_size: 64,
            gradient_accumulation_steps: 1,
            num_workers: 1,
            max_iters: 5000,
            eval_interval: 250,
            eval_iters: 200,
            log_interval: 10,
            save_interval: 1000,
            always_save_checkpoint: false,
            seed: 1337,
            init_from: InitMode::Scratch,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Positive sizes, divisible heads, sane probabilities.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_layer", self.n_layer),
            ("n_head", self.n_head),
            ("n_embd", self.n_embd),
            ("block_size", self.block_size),
            ("batch_size", self.batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("num_workers", self.num_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(LabError::InvalidConfig(format!("{name} must be >= 1")));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(LabError::InvalidConfig(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LabError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.learning_rate <= 0.0 || self.min_lr < 0.0 {
            return Err(LabError::InvalidConfig(format!(
                "learning_rate must be > 0 and min_lr >= 0 (got {}, {})",
                self.learning_rate, self.min_lr
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(LabError::InvalidConfig(format!(
                "betas must be in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if self.grad_clip < 0.0 {
            return Err(LabError::InvalidConfig(format!(
                "grad_clip must be >= 0, got {}",
                self.grad_clip
            )));
        }
        Ok(())
    }

    pub fn model_config(&self, vocab_size: usize) -> GptConfig {
        GptConfig {
            vocab_size,
            block_size: self.block_size,
            n_layer: self.n_layer,
            n_head: self.n_head,
            n_embd: self.n_embd,
            dropout: self.dropout,
            bias: self.bias,
        }
    }

    /// Copy the shape fields of a model config into this one.
    pub fn adopt_shape(&mut self, model: &GptConfig) {
        self.n_layer = model.n_layer;
        self.n_head = model.n_head;
        self.n_embd = model.n_embd;
        self.block_size = model.block_size;
        self.bias = model.bias;
    }

    pub fn schedule(&self) -> LrSchedule {
        LrSchedule {
            learning_rate: self.learning_rate,
            min_lr: self.min_lr,
            warmup_iters: self.warmup_iters,
            lr_decay_iters: self.lr_decay_iters,
            decay_lr: self.decay_lr,
        }
    }

    pub fn optimizer_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: 1e-8,
            weight_decay: self.weight_decay,
        }
    }

    /// Sequences consumed per optimizer step across all workers.
    pub fn sequences_per_step(&self) -> usize {
        self.batch_size * self.num_workers * self.gradient_accumulation_steps
    }

    pub fn tokens_per_step(&self) -> usize {
        self.sequences_per_step() * self.block_size
    }
}

/// Model-shape fields the caller set explicitly. Only these are checked
/// against a checkpoint on resume; the others follow the checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShapeOverrides {
    pub n_layer: bool,
    pub n_head: bool,
    pub n_embd: bool,
    pub block_size: bool,
    pub bias: bool,
}

impl ShapeOverrides {
    pub fn all() -> Self {
        Self {
            n_layer: true,
            n_head: true,
            n_embd: true,
            block_size: true,
            bias: true,
        }
    }
}

/// Size presets for quick experiments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// ~0.2M params, seconds per hundred steps on CPU
    Tiny,
    /// ~10M params, the default character-level model
    Small,
    /// GPT-2 small shape
    Medium,
}

impl Preset {
    pub fn apply(&self, config: &mut TrainConfig) {
        match self {
            Preset::Tiny => {
                config.n_layer = 2;
                config.n_head = 4;
                config.n_embd = 64;
                config.block_size = 64;
                config.batch_size = 16;
                config.dropout = 0.0;
                config.learning_rate = 1e-3;
            }
            Preset::Small => {
                config.n_layer = 6;
                config.n_head = 6;
                config.n_embd = 384;
                config.block_size = 256;
                config.batch_size = 64;
                config.dropout = 0.2;
                config.learning_rate = 1e-3;
            }
            Preset::Medium => {
                config.n_layer = 12;
                config.n_head = 12;
                config.n_embd = 768;
                config.block_size = 1024;
                config.batch_size = 12;
                config.dropout = 0.0;
                config.learning_rate = 6e-4;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let cfg = TrainConfig {
            n_embd: 100,
            n_head: 6,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(LabError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let cfg = TrainConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(LabError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_fills_defaults() -> anyhow::Result<()> {
        let cfg: TrainConfig = serde_json::from_str(
            r#"{"n_layer": 2, "init_from": {"mode": "pretrained", "source": "gpt2"}}"#,
        )?;
        assert_eq!(cfg.n_layer, 2);
        assert_eq!(cfg.n_embd, TrainConfig::default().n_embd);
        assert_eq!(
            cfg.init_from,
            InitMode::Pretrained {
                source: "gpt2".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn test_init_mode_from_str() -> anyhow::Result<()> {
        assert_eq!("scratch".parse::<InitMode>()?, InitMode::Scratch);
        assert_eq!("resume".parse::<InitMode>()?, InitMode::Resume);
        assert_eq!(
            "gpt2-medium".parse::<InitMode>()?,
            InitMode::Pretrained {
                source: "gpt2-medium".to_string()
            }
        );
        Ok(())
    }

    #[test]
    fn test_preset_tiny_is_valid() {
        let mut cfg = TrainConfig::default();
        Preset::Tiny.apply(&mut cfg);
        assert_eq!(cfg.n_embd, 64);
        assert!(cfg.validate().is_ok());
    }
}
