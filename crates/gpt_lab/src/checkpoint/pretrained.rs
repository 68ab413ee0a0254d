//! Start a run from published GPT-2 weights (`config.json` + `model.safetensors`).
//!
//! The source is either a local directory or a Hugging Face hub repo id.
//! GPT-2 stores its projections as Conv1D (`[in, out]`), so those weights are
//! transposed into linear layout on the way in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use gpt_core::model::init::named_vars;
use gpt_core::GptConfig;
use serde::Deserialize;
use tracing::info;

use super::{build_model, fresh_optimizer, TrainingState};
use crate::data::DatasetMeta;
use crate::error::{LabError, Result};
use crate::train::RunContext;

const CONV1D_WEIGHTS: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

#[derive(Deserialize, Debug)]
struct HfGpt2Config {
    model_type: Option<String>,
    vocab_size: usize,
    n_layer: usize,
    n_head: usize,
    n_embd: usize,
    #[serde(alias = "n_ctx")]
    n_positions: usize,
}

fn unsupported(source: &str, reason: impl Into<String>) -> LabError {
    LabError::UnsupportedSource {
        source_id: source.to_string(),
        reason: reason.into(),
    }
}

/// Local paths of `config.json` and `model.safetensors`.
fn resolve(source: &str) -> Result<(PathBuf, PathBuf)> {
    let dir = Path::new(source);
    if dir.is_dir() {
        let config = dir.join("config.json");
        let weights = dir.join("model.safetensors");
        if !config.is_file() || !weights.is_file() {
            return Err(unsupported(
                source,
                "directory must contain config.json and model.safetensors",
            ));
        }
        return Ok((config, weights));
    }

    info!("Downloading '{}' from the hub", source);
    let api = hf_hub::api::sync::Api::new().map_err(|e| unsupported(source, e.to_string()))?;
    let repo = api.model(source.to_string());
    let config = repo
        .get("config.json")
        .map_err(|e| unsupported(source, format!("config.json: {e}")))?;
    let weights = repo
        .get("model.safetensors")
        .map_err(|e| unsupported(source, format!("model.safetensors: {e}")))?;
    Ok((config, weights))
}

fn read_config(source: &str, path: &Path) -> Result<HfGpt2Config> {
    let text = std::fs::read_to_string(path)?;
    let cfg: HfGpt2Config =
        serde_json::from_str(&text).map_err(|e| unsupported(source, format!("config.json: {e}")))?;
    match cfg.model_type.as_deref() {
        Some("gpt2") | None => Ok(cfg),
        Some(other) => Err(unsupported(
            source,
            format!("model_type '{other}' is not a GPT-2 model"),
        )),
    }
}

/// Map GPT-2 tensor names to ours, transposing Conv1D weights and cropping
/// the position table to `block_size`.
fn convert_tensors(
    source: &str,
    raw: HashMap<String, Tensor>,
    block_size: usize,
) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(raw.len());
    for (name, tensor) in raw {
        let name = name.strip_prefix("transformer.").unwrap_or(&name).to_string();
        // Causal-mask buffers and the tied head are not parameters here.
        if name.ends_with(".attn.bias") || name.ends_with(".attn.masked_bias") || name == "lm_head.weight" {
            continue;
        }
        let tensor = if CONV1D_WEIGHTS.iter().any(|suffix| name.ends_with(suffix)) {
            tensor.t()?.contiguous()?
        } else if name == "wpe.weight" {
            tensor.narrow(0, 0, block_size)?.contiguous()?
        } else {
            tensor
        };
        out.insert(name, tensor);
    }
    if out.is_empty() {
        return Err(unsupported(source, "no tensors found"));
    }
    Ok(out)
}

pub(super) fn init_pretrained(ctx: &RunContext, meta: &DatasetMeta, source: &str) -> Result<TrainingState> {
    let (config_path, weights_path) = resolve(source)?;
    let hf = read_config(source, &config_path)?;

    if hf.vocab_size != meta.vocab_size {
        return Err(unsupported(
            source,
            format!(
                "vocab size {} does not match the dataset vocab size {}",
                hf.vocab_size, meta.vocab_size
            ),
        ));
    }
    let block_size = ctx.config.block_size;
    if block_size > hf.n_positions {
        return Err(unsupported(
            source,
            format!(
                "block_size {block_size} exceeds the model's {} positions",
                hf.n_positions
            ),
        ));
    }

    let mut config = ctx.config.clone();
    config.n_layer = hf.n_layer;
    config.n_head = hf.n_head;
    config.n_embd = hf.n_embd;
    config.bias = true;
    let cfg: GptConfig = config.model_config(hf.vocab_size);
    cfg.validate().map_err(|e| unsupported(source, e.to_string()))?;

    let raw = candle_core::safetensors::load(&weights_path, &Device::Cpu)?;
    let tensors = convert_tensors(source, raw, block_size)?;

    let (varmap, model) = build_model(cfg, &ctx.device)?;
    for (name, var) in named_vars(&varmap) {
        let tensor = tensors
            .get(&name)
            .ok_or_else(|| unsupported(source, format!("missing tensor '{name}'")))?;
        if tensor.dims() != var.shape().dims() {
            return Err(unsupported(
                source,
                format!(
                    "tensor '{name}' has shape {:?}, expected {:?}",
                    tensor.dims(),
                    var.shape().dims()
                ),
            ));
        }
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
    }
    let optimizer = fresh_optimizer(&varmap, &config)?;

    info!(
        "Initialized from pretrained '{}' ({} layers, {} heads, {} dims)",
        source, cfg.n_layer, cfg.n_head, cfg.n_embd
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

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_conv1d_weights_are_transposed_and_wpe_cropped() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let raw = HashMap::from([
            (
                "transformer.h.0.attn.c_attn.weight".to_string(),
                Tensor::zeros((4, 12), DType::F32, &device)?,
            ),
            (
                "transformer.wpe.weight".to_string(),
                Tensor::zeros((16, 4), DType::F32, &device)?,
            ),
            (
                "transformer.h.0.attn.bias".to_string(),
                Tensor::zeros((1, 1, 16, 16), DType::F32, &device)?,
            ),
        ]);
        let out = convert_tensors("gpt2", raw, 8)?;
        assert_eq!(out["h.0.attn.c_attn.weight"].dims(), &[12, 4]);
        assert_eq!(out["wpe.weight"].dims(), &[8, 4]);
        assert!(!out.contains_key("h.0.attn.bias"));
        Ok(())
    }

    #[test]
    fn test_non_gpt2_model_type_is_unsupported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"model_type": "llama", "vocab_size": 32000, "n_layer": 2, "n_head": 2, "n_embd": 8, "n_positions": 16}"#,
        )?;
        assert!(matches!(
            read_config("local", &path),
            Err(LabError::UnsupportedSource { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_directory_without_weights_is_unsupported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("config.json"), "{}")?;
        let source = dir.path().display().to_string();
        assert!(matches!(
            resolve(&source),
            Err(LabError::UnsupportedSource { .. })
        ));
        Ok(())
    }
}
