//! Dataset builder: positional train/val split written as fixed-width token
//! arrays plus `meta.json`.
//!
//! Every file goes through `<name>.tmp` + rename, and `meta.json` is written
//! last. A directory is only a dataset once `meta.json` exists.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::info;

use super::meta::{DatasetMeta, TokenWidth, META_FILE, TRAIN_FILE, VAL_FILE};
use crate::error::{LabError, Result};
use crate::tokenizer::VocabSpec;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SplitPolicy {
    /// First `floor(f * len)` tokens train, the rest validation. `f` in `(0, 1]`.
    Fraction(f64),
    SkipValidation,
}

impl SplitPolicy {
    /// Train length for a stream of `len` tokens.
    pub fn split_point(&self, len: usize) -> Result<usize> {
        match *self {
            SplitPolicy::Fraction(f) => {
                if !(f > 0.0 && f <= 1.0) {
                    return Err(LabError::InvalidConfig(format!(
                        "split fraction must be in (0, 1], got {f}"
                    )));
                }
                Ok(((f * len as f64).floor() as usize).min(len))
            }
            SplitPolicy::SkipValidation => Ok(len),
        }
    }
}

pub struct DatasetBuilder {
    output_dir: PathBuf,
    source: String,
}

impl DatasetBuilder {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            source: String::new(),
        }
    }

    /// Free-form description of where the tokens came from.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn build(&self, tokens: &[u32], policy: SplitPolicy, vocab: &VocabSpec) -> Result<DatasetMeta> {
        if tokens.is_empty() {
            return Err(LabError::EmptyCorpus);
        }
        let split = policy.split_point(tokens.len())?;
        let vocab_size = vocab.vocab_size()?;
        if let Some(&id) = tokens.iter().find(|&&id| id as usize >= vocab_size) {
            return Err(LabError::TokenOutOfRange { id, vocab_size });
        }
        let width = TokenWidth::for_vocab(vocab_size);

        std::fs::create_dir_all(&self.output_dir)?;
        // Invalidate any previous dataset before touching the arrays.
        remove_if_exists(&self.output_dir.join(META_FILE))?;

        let (train, val) = tokens.split_at(split);
        write_tokens(&self.output_dir.join(TRAIN_FILE), train, width)?;

        let val_tokens = match policy {
            SplitPolicy::Fraction(_) => {
                write_tokens(&self.output_dir.join(VAL_FILE), val, width)?;
                Some(val.len())
            }
            SplitPolicy::SkipValidation => {
                remove_if_exists(&self.output_dir.join(VAL_FILE))?;
                None
            }
        };

        let meta = DatasetMeta {
            vocab_size,
            token_width: width,
            vocab: vocab.clone(),
            train_tokens: train.len(),
            val_tokens,
            split_fraction: match policy {
                SplitPolicy::Fraction(f) => Some(f),
                SplitPolicy::SkipValidation => None,
            },
            created_at: chrono::Utc::now(),
            source: self.source.clone(),
        };

        let meta_path = self.output_dir.join(META_FILE);
        let tmp = tmp_path(&meta_path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &meta)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, &meta_path)?;

        info!(
            "Dataset written to {:?}: train={} val={} vocab={} ({:?})",
            self.output_dir,
            meta.train_tokens,
            meta.val_tokens.map_or("skipped".to_string(), |v| v.to_string()),
            vocab_size,
            width
        );
        Ok(meta)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn write_tokens(path: &Path, tokens: &[u32], width: TokenWidth) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        match width {
            TokenWidth::U16 => {
                for &t in tokens {
                    writer.write_u16::<LittleEndian>(t as u16)?;
                }
            }
            TokenWidth::U32 => {
                for &t in tokens {
                    writer.write_u32::<LittleEndian>(t)?;
                }
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
