//! Data pipeline: raw text -> tokenizer -> train/val token arrays.
//!
//! - corpus: glob expansion and (compressed) file reading
//! - builder: positional split and atomic dataset writing
//! - loader: memory-mapped token streams and batches
//! - meta: `meta.json` schema

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::info;

pub mod builder;
pub mod corpus;
pub mod loader;
pub mod meta;

pub use builder::{DatasetBuilder, SplitPolicy};
pub use loader::{Dataset, Split, TokenStream};
pub use meta::{DatasetMeta, TokenWidth};

use crate::error::Result;
use crate::tokenizer::{TextTokenizer, Tokenize, TokenizerKind};

#[derive(Args, Debug, Clone)]
pub struct PrepareArgs {
    /// Input corpus (file path or glob, e.g. "data/*.txt")
    #[arg(long)]
    pub input: String,

    /// Output dataset directory
    #[arg(long)]
    pub output_dir: PathBuf,

    /// "char" for a character vocabulary, otherwise a tokenizer.json path or hub id (e.g. "gpt2")
    #[arg(long, default_value = "char")]
    pub tokenizer: String,

    /// Fraction of tokens used for training; the rest is validation
    #[arg(long, default_value_t = 0.9)]
    pub split: f64,

    /// Write train.bin only
    #[arg(long, action)]
    pub skip_validation: bool,

    /// Lines per parallel tokenization chunk
    #[arg(long, default_value_t = 10_000)]
    pub chunk_lines: usize,
}

pub fn run(args: PrepareArgs) -> anyhow::Result<()> {
    let meta = prepare(&args)?;
    println!("✅ Dataset ready in {:?}", args.output_dir);
    println!("   Vocab Size:   {}", meta.vocab_size);
    println!("   Train Tokens: {}", meta.train_tokens);
    match meta.val_tokens {
        Some(v) => println!("   Val Tokens:   {}", v),
        None => println!("   Val Tokens:   (skipped)"),
    }
    Ok(())
}

pub fn prepare(args: &PrepareArgs) -> Result<DatasetMeta> {
    info!("🚀 Preparing dataset from '{}'", args.input);
    let kind: TokenizerKind = args.tokenizer.parse()?;
    let policy = if args.skip_validation {
        SplitPolicy::SkipValidation
    } else {
        SplitPolicy::Fraction(args.split)
    };
    // Reject a bad fraction before reading anything.
    policy.split_point(0)?;

    let paths = corpus::expand(&args.input)?;
    info!("   Found {} files", paths.len());
    let corpus_text = corpus::read_corpus(&paths)?;
    info!("   Corpus: {} bytes", corpus_text.len());

    let tokenizer = TextTokenizer::build(&kind, &corpus_text)?;
    let tokens = encode_parallel(&tokenizer, &corpus_text, args.chunk_lines)?;

    let source = format!("{} ({} files, tokenizer: {})", args.input, paths.len(), args.tokenizer);
    DatasetBuilder::new(&args.output_dir)
        .source(source)
        .build(&tokens, policy, &tokenizer.spec()?)
}

/// Encode `text` in line-aligned chunks on the rayon pool. Output order
/// matches input order. Subword vocabularies may merge across newlines, so
/// they are encoded in one piece.
pub fn encode_parallel(tokenizer: &TextTokenizer, text: &str, chunk_lines: usize) -> Result<Vec<u32>> {
    if let TextTokenizer::Subword(_) = tokenizer {
        info!("   Encoding with the subword tokenizer (single pass)");
        return tokenizer.encode(text);
    }
    let chunks = line_chunks(text, chunk_lines.max(1));

    let pb = ProgressBar::new(chunks.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks")
    {
        pb.set_style(style);
    }

    let encoded: Vec<Vec<u32>> = chunks
        .par_iter()
        .map(|chunk| {
            let ids = tokenizer.encode(chunk);
            pb.inc(1);
            ids
        })
        .collect::<Result<_>>()?;
    pb.finish_and_clear();

    Ok(encoded.into_iter().flatten().collect())
}

/// Split into consecutive slices of `lines` lines each, keeping newlines.
fn line_chunks(text: &str, lines: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            count += 1;
            if count == lines {
                chunks.push(&text[start..=i]);
                start = i + 1;
                count = 0;
            }
        }
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_chunks_cover_text() {
        let text = "a\nbb\nccc\ndddd";
        let chunks = line_chunks(text, 2);
        assert_eq!(chunks, vec!["a\nbb\n", "ccc\ndddd"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_parallel_encoding_matches_serial() -> anyhow::Result<()> {
        let text = "to be or not to be\nthat is the question\n".repeat(50);
        let tok = TextTokenizer::build(&TokenizerKind::Char, &text)?;
        assert_eq!(encode_parallel(&tok, &text, 3)?, tok.encode(&text)?);
        Ok(())
    }

    #[test]
    fn test_subword_merges_across_lines_are_kept() -> anyhow::Result<()> {
        use crate::tokenizer::VocabSpec;

        // BPE without a pre-tokenizer: "\n\n" is a single merged token.
        let tokenizer_json = r#"{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": null,
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "BPE",
                "dropout": null,
                "unk_token": null,
                "continuing_subword_prefix": null,
                "end_of_word_suffix": null,
                "fuse_unk": false,
                "byte_fallback": false,
                "vocab": {"a": 0, "\n": 1, "\n\n": 2},
                "merges": ["\n \n"]
            }
        }"#;
        let tok = TextTokenizer::from_spec(&VocabSpec::Subword {
            identity: "test-bpe".to_string(),
            tokenizer_json: tokenizer_json.to_string(),
            eos_id: None,
        })?;

        let text = "a\n\na\n\n";
        let serial = tok.encode(text)?;
        assert_eq!(serial, vec![0, 2, 0, 2]);
        assert_eq!(encode_parallel(&tok, text, 1)?, serial);
        Ok(())
    }

    #[test]
    fn test_prepare_end_to_end() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.txt");
        std::fs::write(&input, "hello there\ngeneral kenobi\n".repeat(20))?;

        let out = dir.path().join("ds");
        let args = PrepareArgs {
            input: input.display().to_string(),
            output_dir: out.clone(),
            tokenizer: "char".to_string(),
            split: 0.9,
            skip_validation: false,
            chunk_lines: 4,
        };
        let meta = prepare(&args)?;
        let ds = Dataset::open(&out)?;

        assert_eq!(meta.train_tokens + meta.val_tokens.unwrap_or(0), 540);
        assert_eq!(ds.train.len(), meta.train_tokens);
        assert_eq!(ds.meta.vocab, meta.vocab);
        Ok(())
    }
}
