#[cfg(test)]
mod tests {
    use crate::model::init::{init_weights, named_vars};
    use crate::model::{Gpt, GptConfig};
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn build(seed: u64) -> anyhow::Result<(VarMap, Gpt)> {
        let device = Device::Cpu;
        let cfg = GptConfig::new(11, 8, 2, 2, 8);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Gpt::load(cfg, vb)?;
        init_weights(&varmap, &cfg, seed)?;
        Ok((varmap, model))
    }

    #[test]
    fn test_same_seed_same_parameters() -> anyhow::Result<()> {
        let (a, _) = build(1337)?;
        let (b, _) = build(1337)?;
        for ((name_a, va), (name_b, vb)) in named_vars(&a).iter().zip(named_vars(&b).iter()) {
            assert_eq!(name_a, name_b);
            let diff = (va.as_tensor() - vb.as_tensor())?
                .abs()?
                .sum_all()?
                .to_scalar::<f32>()?;
            assert_eq!(diff, 0.0, "parameter {name_a} differs");
        }
        Ok(())
    }

    #[test]
    fn test_layer_norm_gains_start_at_one() -> anyhow::Result<()> {
        let (varmap, _) = build(3)?;
        let vars = named_vars(&varmap);
        let (_, gain) = vars
            .iter()
            .find(|(name, _)| name == "ln_f.weight")
            .expect("ln_f.weight exists");
        assert!(gain.as_tensor().to_vec1::<f32>()?.iter().all(|&g| g == 1.0));
        Ok(())
    }

    #[test]
    fn test_parameter_names_follow_gpt2_layout() -> anyhow::Result<()> {
        let (varmap, model) = build(0)?;
        let names: Vec<String> = named_vars(&varmap).into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"wte.weight".to_string()));
        assert!(names.contains(&"wpe.weight".to_string()));
        assert!(names.contains(&"h.1.attn.c_attn.weight".to_string()));
        assert!(names.contains(&"h.0.mlp.c_proj.bias".to_string()));
        // LM head is tied to wte, so it has no variable of its own.
        assert!(!names.iter().any(|n| n.starts_with("lm_head")));

        let counted: usize = named_vars(&varmap)
            .iter()
            .map(|(_, v)| v.as_tensor().elem_count())
            .sum();
        assert_eq!(counted, model.num_params());
        Ok(())
    }
}
