mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use gpt_core::model::init::named_vars;
use gpt_lab::checkpoint::{Checkpoint, CHECKPOINT_FILE};
use gpt_lab::data::SplitPolicy;
use gpt_lab::inference::{compare, GenerateParams, InferenceEngine};
use gpt_lab::tokenizer::Tokenize;
use gpt_lab::train::{train, ProgressEvent, RunContext, RunState};
use gpt_lab::{InitMode, LabError};

use common::{char_dataset, tiny_config};

/// Dataset plus a checkpoint trained for `steps` steps.
fn trained_run(root: &Path, steps: usize) -> anyhow::Result<PathBuf> {
    let data = root.join("data");
    let out = root.join(format!("out-{steps}"));
    if !data.join("meta.json").exists() {
        char_dataset(&data, 20, SplitPolicy::Fraction(0.9))?;
    }
    let mut config = tiny_config();
    config.max_iters = steps;
    train(&RunContext::new(config, &data, &out), &mut |_: &ProgressEvent| {})?;
    Ok(out)
}

fn params(seed: u64) -> GenerateParams {
    GenerateParams {
        max_new_tokens: 20,
        temperature: 1.0,
        top_k: Some(5),
        seed,
    }
}

#[test]
fn test_generation_is_deterministic_for_fixed_seed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = trained_run(dir.path(), 2)?;
    let engine = InferenceEngine::load(&out, &Device::Cpu)?;

    let prompt = engine.tokenizer().encode("First")?;
    let a = engine.generate(&prompt, &params(42))?;
    let b = engine.generate(&prompt, &params(42))?;
    assert_eq!(a, b);
    assert_eq!(a.len(), prompt.len() + 20);
    assert_eq!(&a[..prompt.len()], prompt.as_slice());

    let from_file = gpt_lab::inference::generate(&out.join(CHECKPOINT_FILE), &prompt, &params(42))?;
    assert_eq!(from_file, a);
    Ok(())
}

#[test]
fn test_empty_prompt_starts_from_token_zero() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = trained_run(dir.path(), 1)?;
    let engine = InferenceEngine::load(&out, &Device::Cpu)?;

    let ids = engine.generate(&[], &params(1))?;
    assert_eq!(ids[0], 0);
    assert_eq!(ids.len(), 21);

    let text = engine.generate_text("", &params(1))?;
    assert_eq!(text.chars().count(), 20);
    Ok(())
}

#[test]
fn test_checkpoint_alone_rebuilds_model_and_tokenizer() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = trained_run(dir.path(), 1)?;
    std::fs::remove_dir_all(dir.path().join("data"))?;

    let engine = InferenceEngine::load(out.join(CHECKPOINT_FILE), &Device::Cpu)?;
    let cfg = engine.model().config;
    assert_eq!(engine.iter_num(), 1);
    assert_eq!(engine.tokenizer().vocab_size(), cfg.vocab_size);

    let idx = Tensor::zeros((2, cfg.block_size), DType::U32, &Device::Cpu)?;
    let logits = engine.model().forward(&idx, false)?;
    assert_eq!(logits.dims(), &[2, cfg.block_size, cfg.vocab_size]);

    let text = engine.tokenizer().decode(&engine.tokenizer().encode("Speak, speak.")?)?;
    assert_eq!(text, "Speak, speak.");
    Ok(())
}

#[test]
fn test_invalid_prompts_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = trained_run(dir.path(), 1)?;
    let engine = InferenceEngine::load(&out, &Device::Cpu)?;
    let vocab = engine.tokenizer().vocab_size() as u32;

    assert!(matches!(
        engine.generate(&[0, vocab], &params(1)),
        Err(LabError::TokenOutOfRange { .. })
    ));
    assert!(matches!(
        engine.generate_text("~", &params(1)),
        Err(LabError::UnknownCharacter { .. })
    ));
    Ok(())
}

#[test]
fn test_compare_returns_one_sample_per_checkpoint() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let early = trained_run(dir.path(), 1)?;
    let late = trained_run(dir.path(), 3)?;

    let samples = compare(
        &[early.clone(), late, early],
        "All:",
        &params(9),
        &Device::Cpu,
    )?;
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[0].iter_num, 1);
    assert_eq!(samples[1].iter_num, 3);
    assert_eq!(samples[0].text, samples[2].text);
    assert!(samples.iter().all(|s| s.text.starts_with("All:")));
    Ok(())
}

#[test]
fn test_local_gpt2_weights_are_imported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data = dir.path().join("data");
    let meta = char_dataset(&data, 20, SplitPolicy::Fraction(0.9))?;
    let device = Device::Cpu;

    let (v, e, positions) = (meta.vocab_size, 8usize, 16usize);
    let randn = |shape: &[usize]| Tensor::randn(0f32, 0.02, shape, &device);
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("wte.weight".into(), randn(&[v, e])?);
    tensors.insert("wpe.weight".into(), randn(&[positions, e])?);
    for ln in ["h.0.ln_1", "h.0.ln_2", "ln_f"] {
        tensors.insert(format!("{ln}.weight"), Tensor::ones(e, DType::F32, &device)?);
        tensors.insert(format!("{ln}.bias"), Tensor::zeros(e, DType::F32, &device)?);
    }
    for (name, inp, outp) in [
        ("attn.c_attn", e, 3 * e),
        ("attn.c_proj", e, e),
        ("mlp.c_fc", e, 4 * e),
        ("mlp.c_proj", 4 * e, e),
    ] {
        tensors.insert(format!("h.0.{name}.weight"), randn(&[inp, outp])?);
        tensors.insert(format!("h.0.{name}.bias"), Tensor::zeros(outp, DType::F32, &device)?);
    }
    tensors.insert(
        "h.0.attn.bias".into(),
        Tensor::ones((1, 1, positions, positions), DType::F32, &device)?,
    );

    let source = dir.path().join("gpt2-mini");
    std::fs::create_dir_all(&source)?;
    candle_core::safetensors::save(&tensors, source.join("model.safetensors"))?;
    std::fs::write(
        source.join("config.json"),
        format!(
            r#"{{"model_type": "gpt2", "vocab_size": {v}, "n_layer": 1, "n_head": 2, "n_embd": {e}, "n_positions": {positions}}}"#
        ),
    )?;

    let mut config = tiny_config();
    config.max_iters = 0;
    config.init_from = InitMode::Pretrained {
        source: source.display().to_string(),
    };
    let out = dir.path().join("out");
    let summary = train(&RunContext::new(config, &data, &out), &mut |_: &ProgressEvent| {})?;
    assert_eq!(summary.state, RunState::Completed);

    let ckpt = Checkpoint::load(out.join(CHECKPOINT_FILE), &device)?;
    let cfg = ckpt.model_config();
    assert_eq!((cfg.n_layer, cfg.n_head, cfg.n_embd, cfg.block_size), (1, 2, e, 8));
    assert!(cfg.bias);

    let (varmap, _) = ckpt.restore_model(cfg, &device)?;
    let vars: HashMap<String, _> = named_vars(&varmap).into_iter().collect();
    let expected = tensors["h.0.attn.c_attn.weight"].t()?;
    let d = (vars["h.0.attn.c_attn.weight"].as_tensor() - &expected)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    assert!(d < 1e-7);
    assert_eq!(vars["wpe.weight"].dims(), &[8, e]);
    Ok(())
}

#[test]
fn test_loading_a_copied_checkpoint_writes_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = trained_run(dir.path(), 1)?;
    let shipped = dir.path().join("shipped");
    std::fs::create_dir_all(&shipped)?;
    std::fs::copy(out.join(CHECKPOINT_FILE), shipped.join(CHECKPOINT_FILE))?;

    let engine = InferenceEngine::load(&shipped, &Device::Cpu)?;
    assert_eq!(engine.iter_num(), 1);

    let names: Vec<_> = std::fs::read_dir(&shipped)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(names, vec![std::ffi::OsString::from(CHECKPOINT_FILE)]);
    Ok(())
}
