use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use gpt_core::model::init::{init_weights, named_vars};
use gpt_core::{AdamW, Gpt, GptConfig, ParamsAdamW, Sampler};

fn tiny_model(varmap: &VarMap) -> anyhow::Result<Gpt> {
    let device = Device::Cpu;
    let cfg = GptConfig::new(13, 6, 2, 2, 16);
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
    let model = Gpt::load(cfg, vb)?;
    init_weights(varmap, &cfg, 1337)?;
    Ok(model)
}

#[test]
fn test_logits_shape() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let idx = Tensor::zeros((3, 6), DType::U32, &Device::Cpu)?;
    let logits = model.forward(&idx, false)?;
    assert_eq!(logits.dims(), &[3, 6, 13]);
    Ok(())
}

#[test]
fn test_rejects_sequence_longer_than_block() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let idx = Tensor::zeros((1, 7), DType::U32, &Device::Cpu)?;
    assert!(model.forward(&idx, false).is_err());
    Ok(())
}

#[test]
fn test_initial_loss_near_uniform() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let idx = Tensor::new(&[[1u32, 2, 3, 4, 5, 6]], &Device::Cpu)?;
    let targets = Tensor::new(&[[2u32, 3, 4, 5, 6, 7]], &Device::Cpu)?;
    let loss = model.loss(&idx, &targets, false)?.to_scalar::<f32>()?;
    let uniform = (13f32).ln();
    assert!((loss - uniform).abs() < 0.5, "loss {loss} vs ln(13) {uniform}");
    Ok(())
}

#[test]
fn test_a_few_steps_reduce_loss_on_fixed_batch() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;
    let vars = named_vars(&varmap);
    let mut opt = AdamW::new(
        vars.clone(),
        ParamsAdamW {
            lr: 1e-2,
            ..Default::default()
        },
    )?;

    let idx = Tensor::new(&[[1u32, 2, 3, 4, 5, 6]], &Device::Cpu)?;
    let targets = Tensor::new(&[[2u32, 3, 4, 5, 6, 7]], &Device::Cpu)?;
    let before = model.loss(&idx, &targets, false)?.to_scalar::<f32>()?;

    for _ in 0..20 {
        let loss = model.loss(&idx, &targets, true)?;
        let grads = loss.backward()?;
        let grads: Vec<Tensor> = vars
            .iter()
            .map(|(_, v)| match grads.get(v.as_tensor()) {
                Some(g) => Ok(g.clone()),
                None => v.as_tensor().zeros_like(),
            })
            .collect::<candle_core::Result<_>>()?;
        opt.step(&grads)?;
    }

    let after = model.loss(&idx, &targets, false)?.to_scalar::<f32>()?;
    assert!(after < before, "loss did not drop: {before} -> {after}");
    Ok(())
}

#[test]
fn test_generate_is_deterministic_and_bounded() -> anyhow::Result<()> {
    let varmap = VarMap::new();
    let model = tiny_model(&varmap)?;

    let run = || -> anyhow::Result<Vec<u32>> {
        let mut sampler = Sampler::new(0.9, Some(5), 99);
        Ok(model.generate(&[1, 2], 10, &mut sampler, None, |_| true)?)
    };
    let a = run()?;
    let b = run()?;
    assert_eq!(a, b);
    assert_eq!(a.len(), 12);
    assert!(a.iter().all(|&t| t < 13));
    Ok(())
}
