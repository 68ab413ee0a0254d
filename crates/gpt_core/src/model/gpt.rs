//! Gpt - Full model: embeddings, blocks, final norm and tied LM head

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Dropout, Embedding, Init, Linear, VarBuilder};

use crate::layers::{LayerNorm, INIT_STD};
use crate::model::block::LAYER_NORM_EPS;
use crate::model::{Block, GptConfig};
use crate::sampling::Sampler;

/// GPT language model. The LM head shares its weight with `wte`.
#[derive(Clone)]
pub struct Gpt {
    pub wte: Embedding,
    pub wpe: Embedding,
    pub drop: Dropout,
    pub blocks: Vec<Block>,
    pub ln_f: LayerNorm,
    pub lm_head: Linear,
    pub config: GptConfig,
}

impl Gpt {
    pub fn load(cfg: GptConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let init = Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        };

        let wte_weight =
            vb.pp("wte")
                .get_with_hints((cfg.vocab_size, cfg.n_embd), "weight", init)?;
        let wpe_weight =
            vb.pp("wpe")
                .get_with_hints((cfg.block_size, cfg.n_embd), "weight", init)?;

        let mut blocks = Vec::with_capacity(cfg.n_layer);
        for i in 0..cfg.n_layer {
            blocks.push(Block::load(&cfg, vb.pp(format!("h.{i}")))?);
        }

        let ln_f = LayerNorm::load(cfg.n_embd, cfg.bias, LAYER_NORM_EPS, vb.pp("ln_f"))?;

        Ok(Self {
            wte: Embedding::new(wte_weight.clone(), cfg.n_embd),
            wpe: Embedding::new(wpe_weight, cfg.n_embd),
            drop: Dropout::new(cfg.dropout),
            blocks,
            ln_f,
            lm_head: Linear::new(wte_weight, None),
            config: cfg,
        })
    }

    /// Logits for every position: `idx [B, T]` -> `[B, T, vocab_size]`.
    pub fn forward(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        let (_b, seq_len) = idx.dims2()?;
        if seq_len > self.config.block_size {
            candle_core::bail!(
                "cannot forward sequence of length {seq_len}, block size is only {}",
                self.config.block_size
            );
        }

        let pos = Tensor::arange(0u32, seq_len as u32, idx.device())?;
        let tok_emb = self.wte.forward(idx)?;
        let pos_emb = self.wpe.forward(&pos)?;
        let mut h = self.drop.forward(&tok_emb.broadcast_add(&pos_emb)?, train)?;

        for block in &self.blocks {
            h = block.forward(&h, train)?;
        }

        let h = self.ln_f.forward(&h)?;
        self.lm_head.forward(&h)
    }

    /// Mean next-token cross-entropy over all positions.
    pub fn loss(&self, idx: &Tensor, targets: &Tensor, train: bool) -> Result<Tensor> {
        let logits = self.forward(idx, train)?;
        let (b_sz, seq_len, vocab) = logits.dims3()?;
        let logits_flat = logits.reshape((b_sz * seq_len, vocab))?;
        let targets_flat = targets.reshape(b_sz * seq_len)?;
        candle_nn::loss::cross_entropy(&logits_flat, &targets_flat)
    }

    pub fn num_params(&self) -> usize {
        self.config.num_params()
    }

    /// Autoregressive sampling. Returns the prompt followed by the new tokens.
    ///
    /// The context is cropped to the last `block_size` tokens at every step.
    /// `on_token` is called for each new token; returning `false` stops early.
    pub fn generate<F>(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        sampler: &mut Sampler,
        eos_id: Option<u32>,
        mut on_token: F,
    ) -> Result<Vec<u32>>
    where
        F: FnMut(u32) -> bool,
    {
        let device = self.wte.embeddings().device().clone();
        let mut tokens = prompt.to_vec();
        if tokens.is_empty() {
            tokens.push(0);
        }

        for _ in 0..max_new_tokens {
            let start = tokens.len().saturating_sub(self.config.block_size);
            let context = &tokens[start..];
            let input = Tensor::new(context, &device)?.unsqueeze(0)?;
            let logits = self.forward(&input, false)?;
            let last = logits
                .squeeze(0)?
                .get(context.len() - 1)?
                .to_dtype(DType::F32)?;

            let next = sampler.sample(&last)?;
            tokens.push(next);

            if !on_token(next) || eos_id == Some(next) {
                break;
            }
        }
        Ok(tokens)
    }
}
