//! Training Arguments - CLI configuration for training

use std::path::PathBuf;

use clap::Args;

use super::context::RunContext;
use crate::config::{InitMode, Preset, ShapeOverrides, TrainConfig};
use crate::error::Result;

/// Training configuration from command line arguments. Flags override the
/// JSON config file, which overrides the preset.
#[derive(Args, Debug, Clone, Default)]
pub struct TrainArgs {
    /// Dataset directory (train.bin, val.bin, meta.json)
    #[arg(long, required = true)]
    pub data: PathBuf,

    /// Run directory for ckpt.safetensors and the stop_signal file
    #[arg(long, default_value = "out")]
    pub out_dir: PathBuf,

    /// JSON config file (TrainConfig)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub preset: Option<Preset>,

    /// scratch | resume | <pretrained source, e.g. gpt2>
    #[arg(long)]
    pub init_from: Option<String>,

    #[arg(long)]
    pub n_layer: Option<usize>,
    #[arg(long)]
    pub n_head: Option<usize>,
    #[arg(long)]
    pub n_embd: Option<usize>,
    #[arg(long)]
    pub block_size: Option<usize>,
    #[arg(long)]
    pub bias: Option<bool>,
    #[arg(long)]
    pub dropout: Option<f32>,

    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long)]
    pub min_lr: Option<f64>,
    #[arg(long)]
    pub warmup_iters: Option<usize>,
    #[arg(long)]
    pub lr_decay_iters: Option<usize>,
    #[arg(long)]
    pub weight_decay: Option<f64>,
    #[arg(long)]
    pub grad_clip: Option<f64>,

    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Gradient accumulation steps
    #[arg(long)]
    pub accum: Option<usize>,
    #[arg(long)]
    pub workers: Option<usize>,

    #[arg(long)]
    pub max_iters: Option<usize>,
    #[arg(long)]
    pub eval_interval: Option<usize>,
    #[arg(long)]
    pub eval_iters: Option<usize>,
    #[arg(long)]
    pub log_interval: Option<usize>,
    #[arg(long)]
    pub save_interval: Option<usize>,
    #[arg(long, action)]
    pub always_save: bool,
    #[arg(long)]
    pub seed: Option<u64>,

    /// Force CPU even when CUDA is available
    #[arg(long, action)]
    pub cpu: bool,

    /// Also print progress events to stdout as JSON lines
    #[arg(long, action)]
    pub json_events: bool,
}

fn set<T>(target: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *target = v;
            true
        }
        None => false,
    }
}

impl TrainArgs {
    /// Resolved config plus the shape fields the user pinned.
    pub fn resolve(&self) -> Result<(TrainConfig, ShapeOverrides)> {
        let mut config = TrainConfig::default();
        let mut pinned = ShapeOverrides::default();

        if let Some(preset) = self.preset {
            preset.apply(&mut config);
            pinned = ShapeOverrides::all();
        }
        if let Some(path) = &self.config {
            config = TrainConfig::from_json_file(path)?;
            pinned = ShapeOverrides::all();
        }

        pinned.n_layer |= set(&mut config.n_layer, self.n_layer);
        pinned.n_head |= set(&mut config.n_head, self.n_head);
        pinned.n_embd |= set(&mut config.n_embd, self.n_embd);
        pinned.block_size |= set(&mut config.block_size, self.block_size);
        pinned.bias |= set(&mut config.bias, self.bias);
        set(&mut config.dropout, self.dropout);

        set(&mut config.learning_rate, self.lr);
        set(&mut config.min_lr, self.min_lr);
        set(&mut config.warmup_iters, self.warmup_iters);
        set(&mut config.lr_decay_iters, self.lr_decay_iters);
        set(&mut config.weight_decay, self.weight_decay);
        set(&mut config.grad_clip, self.grad_clip);
        set(&mut config.batch_size, self.batch_size);
        set(&mut config.gradient_accumulation_steps, self.accum);
        set(&mut config.num_workers, self.workers);
        set(&mut config.max_iters, self.max_iters);
        set(&mut config.eval_interval, self.eval_interval);
        set(&mut config.eval_iters, self.eval_iters);
        set(&mut config.log_interval, self.log_interval);
        set(&mut config.save_interval, self.save_interval);
        set(&mut config.seed, self.seed);
        if self.always_save {
            config.always_save_checkpoint = true;
        }
        if let Some(mode) = &self.init_from {
            config.init_from = mode.parse::<InitMode>()?;
        }

        config.validate()?;
        Ok((config, pinned))
    }

    pub fn to_context(&self) -> Result<RunContext> {
        let (config, pinned) = self.resolve()?;
        let device = gpt_core::device_utils::select_device(self.cpu);
        Ok(RunContext::new(config, &self.data, &self.out_dir)
            .with_device(device)
            .with_overrides(pinned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_pin_only_given_shape_fields() -> anyhow::Result<()> {
        let args = TrainArgs {
            n_layer: Some(3),
            lr: Some(5e-4),
            init_from: Some("resume".to_string()),
            ..Default::default()
        };
        let (config, pinned) = args.resolve()?;
        assert_eq!(config.n_layer, 3);
        assert_eq!(config.learning_rate, 5e-4);
        assert_eq!(config.init_from, InitMode::Resume);
        assert!(pinned.n_layer);
        assert!(!pinned.n_embd && !pinned.block_size);
        Ok(())
    }

    #[test]
    fn test_preset_pins_shape() -> anyhow::Result<()> {
        let args = TrainArgs {
            preset: Some(Preset::Tiny),
            block_size: Some(32),
            ..Default::default()
        };
        let (config, pinned) = args.resolve()?;
        assert_eq!(config.n_embd, 64);
        assert_eq!(config.block_size, 32);
        assert_eq!(pinned, ShapeOverrides::all());
        Ok(())
    }
}
