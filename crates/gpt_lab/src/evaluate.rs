//! Loss estimation and evaluation-only runs.
//!
//! Evaluation-only mode runs `Initializing -> Evaluating (x N seeds) -> Completed`:
//! zero optimizer steps, no checkpoint writes.

use std::path::PathBuf;

use candle_core::Device;
use clap::Args;
use gpt_core::Gpt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::checkpoint;
use crate::config::{InitMode, TrainConfig};
use crate::data::{Dataset, Split, TokenStream};
use crate::error::{LabError, Result};
use crate::train::{derive_seed, RunContext, RunState};

/// Mean loss over `eval_iters` random batches of `stream`, no dropout.
pub fn estimate_loss(
    model: &Gpt,
    stream: &TokenStream,
    eval_iters: usize,
    batch_size: usize,
    seed: u64,
    device: &Device,
) -> Result<f32> {
    let block_size = model.config.block_size;
    let iters = eval_iters.max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut total = 0f64;
    for _ in 0..iters {
        let starts = stream.sample_starts(&mut rng, batch_size, block_size);
        let (x, y) = stream.batch(&starts, block_size, device)?;
        total += model.loss(&x, &y, false)?.to_scalar::<f32>()? as f64;
    }
    Ok((total / iters as f64) as f32)
}

/// Seed for evaluating `split` at `step` of a run seeded with `seed`.
pub fn eval_seed(seed: u64, step: usize, split: Split) -> u64 {
    derive_seed(&[seed, step as u64, split.tag()])
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvalReport {
    pub step: usize,
    pub losses: Vec<f32>,
    pub mean: f32,
    pub std: f32,
}

impl EvalReport {
    fn from_losses(step: usize, losses: Vec<f32>) -> Self {
        let n = losses.len().max(1) as f32;
        let mean = losses.iter().sum::<f32>() / n;
        let var = losses.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / n;
        Self {
            step,
            losses,
            mean,
            std: var.sqrt(),
        }
    }
}

/// Validation loss of the model obtained from `ctx.config.init_from`, once per
/// seed `seed + i` for `i in 0..num_seeds`.
pub fn evaluate_only(ctx: &RunContext, num_seeds: usize) -> Result<EvalReport> {
    let mut run_state = RunState::Initializing;
    debug!("run state {:?}", run_state);
    ctx.config.validate()?;
    if num_seeds == 0 {
        return Err(LabError::InvalidConfig("num_seeds must be >= 1".to_string()));
    }

    let dataset = Dataset::open(&ctx.dataset_dir)?;
    let Some(val) = dataset.split(Split::Val) else {
        return Err(LabError::InvalidConfig(
            "evaluation-only mode needs a validation split, but this dataset was built with validation skipped".to_string(),
        ));
    };

    let state = checkpoint::initialize(ctx, &dataset.meta)?;
    let cfg: &TrainConfig = &state.config;
    val.require_block(Split::Val, cfg.block_size)?;

    run_state = RunState::Evaluating;
    debug!("run state {:?}", run_state);
    let step = state.iter_num;
    let mut losses = Vec::with_capacity(num_seeds);
    for i in 0..num_seeds as u64 {
        let seed = cfg.seed.wrapping_add(i);
        let loss = estimate_loss(
            &state.model,
            val,
            cfg.eval_iters,
            cfg.batch_size,
            eval_seed(seed, step, Split::Val),
            &ctx.device,
        )?;
        info!("Eval seed {} | step {} | val loss {:.4}", seed, step, loss);
        losses.push(loss);
    }

    run_state = RunState::Completed;
    debug!("run state {:?}", run_state);
    Ok(EvalReport::from_losses(step, losses))
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Dataset directory (train.bin, val.bin, meta.json)
    #[arg(long)]
    pub data: PathBuf,

    /// Run directory holding ckpt.safetensors
    #[arg(long, default_value = "out")]
    pub out_dir: PathBuf,

    /// JSON config file (TrainConfig)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// scratch | resume | <pretrained source>
    #[arg(long, default_value = "resume")]
    pub init_from: String,

    /// Number of evaluation seeds
    #[arg(long, default_value_t = 1)]
    pub seeds: usize,

    #[arg(long)]
    pub eval_iters: Option<usize>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, action)]
    pub cpu: bool,
}

pub fn run(args: EvaluateArgs) -> anyhow::Result<()> {
    info!("--- GPT Lab Evaluation ---");
    let mut config = match &args.config {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig::default(),
    };
    config.init_from = args.init_from.parse::<InitMode>()?;
    if let Some(v) = args.eval_iters {
        config.eval_iters = v;
    }
    if let Some(v) = args.batch_size {
        config.batch_size = v;
    }
    if let Some(v) = args.seed {
        config.seed = v;
    }

    let device = gpt_core::device_utils::select_device(args.cpu);
    let ctx = RunContext::new(config, &args.data, &args.out_dir)
        .with_device(device)
        .with_overrides(Default::default());
    let report = evaluate_only(&ctx, args.seeds)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
