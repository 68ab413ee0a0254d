#![allow(dead_code)]

use std::path::Path;

use gpt_lab::data::{DatasetBuilder, DatasetMeta, SplitPolicy};
use gpt_lab::tokenizer::{TextTokenizer, Tokenize, TokenizerKind};
use gpt_lab::TrainConfig;

pub const CORPUS: &str = "First Citizen:\nBefore we proceed any further, hear me speak.\n\nAll:\nSpeak, speak.\n\nFirst Citizen:\nYou are all resolved rather to die than to famish?\n";

/// Character dataset of the repeated corpus.
pub fn char_dataset(dir: &Path, repeats: usize, policy: SplitPolicy) -> anyhow::Result<DatasetMeta> {
    let text = CORPUS.repeat(repeats);
    let tok = TextTokenizer::build(&TokenizerKind::Char, &text)?;
    let tokens = tok.encode(&text)?;
    Ok(DatasetBuilder::new(dir)
        .source("test corpus")
        .build(&tokens, policy, &tok.spec()?)?)
}

/// A model small enough for a few CPU steps per test.
pub fn tiny_config() -> TrainConfig {
    TrainConfig {
        n_layer: 1,
        n_head: 2,
        n_embd: 16,
        block_size: 8,
        dropout: 0.0,
        bias: true,
        learning_rate: 1e-2,
        min_lr: 1e-3,
        warmup_iters: 2,
        lr_decay_iters: 20,
        decay_lr: true,
        batch_size: 4,
        gradient_accumulation_steps: 1,
        num_workers: 1,
        max_iters: 4,
        eval_interval: 1000,
        eval_iters: 2,
        log_interval: 1,
        save_interval: 0,
        seed: 1337,
        ..Default::default()
    }
}

/// Largest absolute difference between the parameters of two checkpoints.
pub fn max_param_diff(a: &Path, b: &Path) -> anyhow::Result<f32> {
    use candle_core::Device;
    use gpt_core::model::init::named_vars;
    use gpt_lab::checkpoint::Checkpoint;

    let ca = Checkpoint::load(a, &Device::Cpu)?;
    let cb = Checkpoint::load(b, &Device::Cpu)?;
    let (va, _) = ca.restore_model(ca.model_config(), &Device::Cpu)?;
    let (vb, _) = cb.restore_model(cb.model_config(), &Device::Cpu)?;

    let mut max = 0f32;
    for ((name_a, x), (name_b, y)) in named_vars(&va).iter().zip(named_vars(&vb).iter()) {
        assert_eq!(name_a, name_b);
        let d = (x.as_tensor() - y.as_tensor())?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        max = max.max(d);
    }
    Ok(max)
}
