//! Checkpoint store: one self-describing `ckpt.safetensors` per run.
//!
//! Tensors are stored as `model.<param>`, `optim.m.<param>` and
//! `optim.v.<param>`. The safetensors header metadata carries `format`,
//! `version`, `config` (TrainConfig), `vocab` (VocabSpec) and `state`
//! (progress counters), all as JSON strings.
//!
//! Writes go to `<path>.tmp` and are renamed into place while holding an
//! exclusive lock on `<path>.lock`, so readers never observe a partial file.

pub mod pretrained;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use gpt_core::model::init::{init_weights, named_vars};
use gpt_core::{AdamW, Gpt, GptConfig};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{InitMode, TrainConfig};
use crate::data::DatasetMeta;
use crate::error::{LabError, Result};
use crate::tokenizer::VocabSpec;
use crate::train::RunContext;

pub const CHECKPOINT_FILE: &str = "ckpt.safetensors";
pub const FORMAT_TAG: &str = "gpt-lab-checkpoint";
pub const FORMAT_VERSION: u32 = 1;

const MODEL_PREFIX: &str = "model.";
const OPTIM_M_PREFIX: &str = "optim.m.";
const OPTIM_V_PREFIX: &str = "optim.v.";

/// Progress counters stored in the `state` metadata entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointState {
    pub iter_num: usize,
    /// `None` until a validation loss has been measured.
    pub best_val_loss: Option<f32>,
    pub optimizer_step: usize,
    pub vocab_size: usize,
    pub saved_at: DateTime<Utc>,
}

/// Live model + optimizer + counters of a run.
pub struct TrainingState {
    pub config: TrainConfig,
    pub vocab: VocabSpec,
    pub varmap: VarMap,
    pub model: Gpt,
    pub optimizer: AdamW,
    pub iter_num: usize,
    pub best_val_loss: f32,
}

impl TrainingState {
    pub fn model_config(&self) -> GptConfig {
        self.model.config
    }
}

/// Fresh parameters laid out for `cfg`. Values are candle defaults until
/// initialized or assigned.
pub fn build_model(cfg: GptConfig, device: &Device) -> Result<(VarMap, Gpt)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Gpt::load(cfg, vb)?;
    Ok((varmap, model))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn corrupt(path: &Path, reason: impl Into<String>) -> LabError {
    LabError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Atomically write `state` to `path`.
pub fn save(state: &TrainingState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut tensors: Vec<(String, Tensor)> = Vec::new();
    for (name, var) in named_vars(&state.varmap) {
        tensors.push((format!("{MODEL_PREFIX}{name}"), var.as_tensor().detach()));
    }
    for (name, m, v) in state.optimizer.moments() {
        tensors.push((format!("{OPTIM_M_PREFIX}{name}"), m.detach()));
        tensors.push((format!("{OPTIM_V_PREFIX}{name}"), v.detach()));
    }

    let progress = CheckpointState {
        iter_num: state.iter_num,
        best_val_loss: state.best_val_loss.is_finite().then_some(state.best_val_loss),
        optimizer_step: state.optimizer.step_count(),
        vocab_size: state.model.config.vocab_size,
        saved_at: Utc::now(),
    };
    let metadata: HashMap<String, String> = HashMap::from([
        ("format".to_string(), FORMAT_TAG.to_string()),
        ("version".to_string(), FORMAT_VERSION.to_string()),
        ("config".to_string(), serde_json::to_string(&state.config)?),
        ("vocab".to_string(), serde_json::to_string(&state.vocab)?),
        ("state".to_string(), serde_json::to_string(&progress)?),
    ]);

    let lock_file = File::create(lock_path(path))?;
    lock_file.lock_exclusive()?;

    let tmp = tmp_path(path);
    let written = safetensors::serialize_to_file(tensors.iter().map(|(n, t)| (n.as_str(), t)), &Some(metadata), &tmp)
        .map_err(|e| corrupt(&tmp, format!("failed to serialize: {e}")))
        .and_then(|()| std::fs::rename(&tmp, path).map_err(LabError::from));

    lock_file.unlock()?;
    written?;

    info!("💾 Checkpoint saved: {:?} (iter {})", path, state.iter_num);
    Ok(())
}

/// A parsed checkpoint file. Tensors are on the device given to [`Checkpoint::load`].
pub struct Checkpoint {
    pub path: PathBuf,
    pub config: TrainConfig,
    pub vocab: VocabSpec,
    pub state: CheckpointState,
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        // Read-only: share the writer's lock file when it exists, never create it.
        let lock_file = OpenOptions::new().read(true).open(lock_path(path)).ok();
        if let Some(lock) = &lock_file {
            lock.lock_shared()?;
        }
        let parsed = Self::map_and_parse(path, device);
        if let Some(lock) = &lock_file {
            lock.unlock()?;
        }
        parsed
    }

    fn map_and_parse(path: &Path, device: &Device) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(corrupt(path, "empty file"));
        }
        // SAFETY: writers only replace the file by rename, never in place.
        let mmap = unsafe { Mmap::map(&file) }?;
        Self::parse(path, &mmap, device)
    }

    fn parse(path: &Path, buffer: &[u8], device: &Device) -> Result<Self> {
        let (_, header) = safetensors::SafeTensors::read_metadata(buffer)
            .map_err(|e| corrupt(path, format!("unreadable header: {e}")))?;
        let meta = header
            .metadata()
            .as_ref()
            .ok_or_else(|| corrupt(path, "missing metadata"))?;
        let entry = |key: &str| {
            meta.get(key)
                .ok_or_else(|| corrupt(path, format!("missing metadata key '{key}'")))
        };

        let format = entry("format")?;
        if format != FORMAT_TAG {
            return Err(corrupt(path, format!("unexpected format '{format}'")));
        }
        let version: u32 = entry("version")?
            .parse()
            .map_err(|e| corrupt(path, format!("bad version: {e}")))?;
        if version > FORMAT_VERSION {
            return Err(corrupt(path, format!("unsupported version {version}")));
        }
        let config: TrainConfig = serde_json::from_str(entry("config")?)
            .map_err(|e| corrupt(path, format!("bad config: {e}")))?;
        let vocab: VocabSpec = serde_json::from_str(entry("vocab")?)
            .map_err(|e| corrupt(path, format!("bad vocab: {e}")))?;
        let state: CheckpointState = serde_json::from_str(entry("state")?)
            .map_err(|e| corrupt(path, format!("bad state: {e}")))?;

        let tensors = candle_core::safetensors::load_buffer(buffer, device)
            .map_err(|e| corrupt(path, format!("unreadable tensors: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
            vocab,
            state,
            tensors,
        })
    }

    /// Model shape rebuilt from the embedded config alone.
    pub fn model_config(&self) -> GptConfig {
        self.config.model_config(self.state.vocab_size)
    }

    /// Build the model and copy the stored parameters into it.
    pub fn restore_model(&self, cfg: GptConfig, device: &Device) -> Result<(VarMap, Gpt)> {
        let (varmap, model) = build_model(cfg, device)?;
        for (name, var) in named_vars(&varmap) {
            let key = format!("{MODEL_PREFIX}{name}");
            let tensor = self.tensor(&key, var.shape().dims())?;
            var.set(&tensor.to_device(var.device())?)?;
        }
        Ok((varmap, model))
    }

    /// Restore AdamW moments and step counter for the given optimizer.
    pub fn restore_optimizer(&self, optimizer: &mut AdamW) -> Result<()> {
        let mut m = HashMap::new();
        let mut v = HashMap::new();
        for (name, var) in optimizer.vars() {
            let dims = var.shape().dims();
            m.insert(name.clone(), self.tensor(&format!("{OPTIM_M_PREFIX}{name}"), dims)?.clone());
            v.insert(name.clone(), self.tensor(&format!("{OPTIM_V_PREFIX}{name}"), dims)?.clone());
        }
        optimizer.load_state(self.state.optimizer_step, &m, &v)?;
        Ok(())
    }

    fn tensor(&self, key: &str, dims: &[usize]) -> Result<&Tensor> {
        let tensor = self
            .tensors
            .get(key)
            .ok_or_else(|| corrupt(&self.path, format!("missing tensor '{key}'")))?;
        if tensor.dims() != dims {
            return Err(corrupt(
                &self.path,
                format!("tensor '{key}' has shape {:?}, expected {:?}", tensor.dims(), dims),
            ));
        }
        Ok(tensor)
    }

    pub fn best_val_loss(&self) -> f32 {
        self.state.best_val_loss.unwrap_or(f32::INFINITY)
    }
}

/// Obtain the starting state of a run according to `ctx.config.init_from`.
pub fn initialize(ctx: &RunContext, meta: &DatasetMeta) -> Result<TrainingState> {
    match &ctx.config.init_from {
        InitMode::Scratch => init_scratch(ctx, meta),
        InitMode::Resume => init_resume(ctx, meta),
        InitMode::Pretrained { source } => pretrained::init_pretrained(ctx, meta, source),
    }
}

fn fresh_optimizer(varmap: &VarMap, config: &TrainConfig) -> Result<AdamW> {
    Ok(AdamW::new(named_vars(varmap), config.optimizer_params())?)
}

fn init_scratch(ctx: &RunContext, meta: &DatasetMeta) -> Result<TrainingState> {
    let config = ctx.config.clone();
    let cfg = config.model_config(meta.vocab_size);
    let (varmap, model) = build_model(cfg, &ctx.device)?;
    init_weights(&varmap, &cfg, config.seed)?;
    let optimizer = fresh_optimizer(&varmap, &config)?;
    info!(
        "Initialized a new model from scratch ({:.2}M params)",
        cfg.num_params() as f64 / 1e6
    );
    Ok(TrainingState {
        config,
        vocab: meta.vocab.clone(),
        varmap,
        model,
        optimizer,
        iter_num: 0,
        best_val_loss: f32::INFINITY,
    })
}

/// Shape fields the caller pinned that disagree with the checkpoint.
fn check_compatible(ctx: &RunContext, ckpt: &Checkpoint, meta: &DatasetMeta) -> Result<()> {
    let requested = &ctx.config;
    let stored = &ckpt.config;
    let o = ctx.overrides;
    let pairs: [(&str, bool, String, String); 5] = [
        ("n_layer", o.n_layer, stored.n_layer.to_string(), requested.n_layer.to_string()),
        ("n_head", o.n_head, stored.n_head.to_string(), requested.n_head.to_string()),
        ("n_embd", o.n_embd, stored.n_embd.to_string(), requested.n_embd.to_string()),
        ("block_size", o.block_size, stored.block_size.to_string(), requested.block_size.to_string()),
        ("bias", o.bias, stored.bias.to_string(), requested.bias.to_string()),
    ];
    for (field, pinned, checkpoint, requested) in pairs {
        if pinned && checkpoint != requested {
            return Err(LabError::IncompatibleConfig {
                field: field.to_string(),
                checkpoint,
                requested,
            });
        }
    }

    if ckpt.state.vocab_size != meta.vocab_size {
        return Err(LabError::IncompatibleConfig {
            field: "vocab_size".to_string(),
            checkpoint: ckpt.state.vocab_size.to_string(),
            requested: meta.vocab_size.to_string(),
        });
    }
    if ckpt.vocab != meta.vocab {
        return Err(LabError::IncompatibleConfig {
            field: "vocab".to_string(),
            checkpoint: "checkpoint vocabulary".to_string(),
            requested: "dataset vocabulary (different symbols)".to_string(),
        });
    }
    Ok(())
}

fn init_resume(ctx: &RunContext, meta: &DatasetMeta) -> Result<TrainingState> {
    let path = ctx.checkpoint_path();
    info!("Resuming training from {:?}", path);
    let ckpt = Checkpoint::load(&path, &ctx.device)?;
    check_compatible(ctx, &ckpt, meta)?;

    // Shape follows the checkpoint, everything else follows the caller.
    let mut config = ctx.config.clone();
    let stored_shape = ckpt.model_config();
    config.adopt_shape(&stored_shape);
    let cfg = GptConfig {
        dropout: config.dropout,
        ..stored_shape
    };

    let (varmap, model) = ckpt.restore_model(cfg, &ctx.device)?;
    let mut optimizer = fresh_optimizer(&varmap, &config)?;
    ckpt.restore_optimizer(&mut optimizer)?;

    if ckpt.config.dropout != config.dropout {
        warn!(
            "Dropout overridden on resume: {} -> {}",
            ckpt.config.dropout, config.dropout
        );
    }
    info!(
        "Resumed at iter {} (best val loss {:?})",
        ckpt.state.iter_num, ckpt.state.best_val_loss
    );

    Ok(TrainingState {
        config,
        vocab: ckpt.vocab.clone(),
        varmap,
        model,
        optimizer,
        iter_num: ckpt.state.iter_num,
        best_val_loss: ckpt.best_val_loss(),
    })
}
