//! Inference engine: checkpoint -> model -> seeded autoregressive sampling.
//!
//! The model and tokenizer are rebuilt from the checkpoint alone. Output is
//! deterministic for a fixed (checkpoint, prompt, params).

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use candle_core::Device;
use clap::Args;
use gpt_core::{Gpt, GptConfig, Sampler};
use serde::Serialize;

use crate::checkpoint::{Checkpoint, CHECKPOINT_FILE};
use crate::error::{LabError, Result};
use crate::tokenizer::{TextTokenizer, Tokenize};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerateParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: Option<usize>,
    pub seed: u64,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 500,
            temperature: 0.8,
            top_k: Some(200),
            seed: 1337,
        }
    }
}

pub struct InferenceEngine {
    model: Gpt,
    tokenizer: TextTokenizer,
    checkpoint: PathBuf,
    iter_num: usize,
}

impl InferenceEngine {
    /// Accepts a checkpoint file or a run directory containing `ckpt.safetensors`.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = resolve_checkpoint(path.as_ref());
        let ckpt = Checkpoint::load(&path, device)?;
        let cfg = GptConfig {
            dropout: 0.0,
            ..ckpt.model_config()
        };
        let (_varmap, model) = ckpt.restore_model(cfg, device)?;
        let tokenizer = TextTokenizer::from_spec(&ckpt.vocab)?;
        if tokenizer.vocab_size() != cfg.vocab_size {
            return Err(LabError::CheckpointCorrupt {
                path,
                reason: format!(
                    "vocabulary has {} symbols but the model expects {}",
                    tokenizer.vocab_size(),
                    cfg.vocab_size
                ),
            });
        }
        tracing::info!(
            "Loaded {:?} (iter {}, {:.2}M params)",
            path,
            ckpt.state.iter_num,
            cfg.num_params() as f64 / 1e6
        );
        Ok(Self {
            model,
            tokenizer,
            iter_num: ckpt.state.iter_num,
            checkpoint: path,
        })
    }

    pub fn model(&self) -> &Gpt {
        &self.model
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    pub fn iter_num(&self) -> usize {
        self.iter_num
    }

    /// Prompt followed by the sampled continuation. An empty prompt starts
    /// from token 0.
    pub fn generate(&self, prompt: &[u32], params: &GenerateParams) -> Result<Vec<u32>> {
        self.generate_with(prompt, params, |_| true)
    }

    /// Like [`generate`](Self::generate), calling `on_token` for each new
    /// token; returning `false` stops early.
    pub fn generate_with<F>(&self, prompt: &[u32], params: &GenerateParams, on_token: F) -> Result<Vec<u32>>
    where
        F: FnMut(u32) -> bool,
    {
        let vocab_size = self.model.config.vocab_size;
        if let Some(&id) = prompt.iter().find(|&&id| id as usize >= vocab_size) {
            return Err(LabError::TokenOutOfRange { id, vocab_size });
        }
        let mut sampler = Sampler::new(params.temperature, params.top_k, params.seed);
        Ok(self.model.generate(
            prompt,
            params.max_new_tokens,
            &mut sampler,
            self.tokenizer.eos_id(),
            on_token,
        )?)
    }

    /// Encode, generate, decode. The synthetic start token of an empty
    /// prompt is not part of the returned text.
    pub fn generate_text(&self, prompt: &str, params: &GenerateParams) -> Result<String> {
        let ids = self.tokenizer.encode(prompt)?;
        let out = self.generate(&ids, params)?;
        let skip = usize::from(ids.is_empty());
        self.tokenizer.decode(&out[skip..])
    }
}

fn resolve_checkpoint(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CHECKPOINT_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Load `checkpoint` read-only and sample from it.
pub fn generate(checkpoint: &Path, prompt: &[u32], params: &GenerateParams) -> Result<Vec<u32>> {
    InferenceEngine::load(checkpoint, &Device::Cpu)?.generate(prompt, params)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub checkpoint: PathBuf,
    pub iter_num: usize,
    pub text: String,
}

/// One sample per checkpoint with identical prompt, parameters and seed.
pub fn compare(checkpoints: &[PathBuf], prompt: &str, params: &GenerateParams, device: &Device) -> Result<Vec<Sample>> {
    checkpoints
        .iter()
        .map(|path| {
            let engine = InferenceEngine::load(path, device)?;
            Ok(Sample {
                checkpoint: engine.checkpoint.clone(),
                iter_num: engine.iter_num,
                text: engine.generate_text(prompt, params)?,
            })
        })
        .collect()
}

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------

#[derive(Args, Debug, Clone)]
pub struct SamplingArgs {
    #[arg(long, default_value = "")]
    pub prompt: String,

    /// Read the prompt from a file instead
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    #[arg(long, default_value_t = 500)]
    pub max_new_tokens: usize,

    #[arg(long, default_value_t = 0.8)]
    pub temperature: f64,

    /// 0 disables top-k filtering
    #[arg(long, default_value_t = 200)]
    pub top_k: usize,

    #[arg(long, default_value_t = 1337)]
    pub seed: u64,

    #[arg(long, action)]
    pub cpu: bool,
}

impl SamplingArgs {
    pub fn params(&self) -> GenerateParams {
        GenerateParams {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_k: (self.top_k > 0).then_some(self.top_k),
            seed: self.seed,
        }
    }

    pub fn prompt(&self) -> anyhow::Result<String> {
        match &self.prompt_file {
            Some(path) => Ok(std::fs::read_to_string(path)?),
            None => Ok(self.prompt.clone()),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    /// Checkpoint file or run directory
    #[arg(long, default_value = "out")]
    pub checkpoint: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub num_samples: usize,

    /// Read prompts from stdin until "exit"
    #[arg(long, action)]
    pub interactive: bool,

    #[command(flatten)]
    pub sampling: SamplingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CompareArgs {
    /// Checkpoint files or run directories
    #[arg(long, required = true, num_args = 1..)]
    pub checkpoints: Vec<PathBuf>,

    #[command(flatten)]
    pub sampling: SamplingArgs,
}

pub fn run_generate(args: GenerateArgs) -> anyhow::Result<()> {
    let device = gpt_core::device_utils::select_device(args.sampling.cpu);
    let engine = InferenceEngine::load(&args.checkpoint, &device)?;
    let mut params = args.sampling.params();

    if args.interactive {
        loop {
            print!("\n> ");
            io::stdout().flush()?;
            let mut prompt = String::new();
            if io::stdin().read_line(&mut prompt)? == 0 {
                break;
            }
            let prompt = prompt.trim_end_matches(['\r', '\n']);
            if prompt == "exit" || prompt == "quit" {
                break;
            }
            match engine.generate_text(prompt, &params) {
                Ok(text) => println!("{text}"),
                Err(e) => println!("Error: {e}"),
            }
            params.seed = params.seed.wrapping_add(1);
        }
        return Ok(());
    }

    let prompt = args.sampling.prompt()?;
    for i in 0..args.num_samples.max(1) {
        let text = engine.generate_text(&prompt, &params)?;
        println!("{text}");
        println!("---------------");
        tracing::debug!("sample {} done", i);
        params.seed = params.seed.wrapping_add(1);
    }
    Ok(())
}

pub fn run_compare(args: CompareArgs) -> anyhow::Result<()> {
    let device = gpt_core::device_utils::select_device(args.sampling.cpu);
    let prompt = args.sampling.prompt()?;
    let samples = compare(&args.checkpoints, &prompt, &args.sampling.params(), &device)?;
    for sample in samples {
        println!("=== {:?} (iter {}) ===", sample.checkpoint, sample.iter_num);
        println!("{}", sample.text);
    }
    Ok(())
}
