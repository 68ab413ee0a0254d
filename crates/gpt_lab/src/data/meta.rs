//! Dataset metadata (`meta.json`) and on-disk layout.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};
use crate::tokenizer::VocabSpec;

pub const TRAIN_FILE: &str = "train.bin";
pub const VAL_FILE: &str = "val.bin";
pub const META_FILE: &str = "meta.json";

/// Element width of the token arrays.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenWidth {
    U16,
    U32,
}

impl TokenWidth {
    pub fn for_vocab(vocab_size: usize) -> Self {
        if vocab_size <= 1 << 16 {
            TokenWidth::U16
        } else {
            TokenWidth::U32
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            TokenWidth::U16 => 2,
            TokenWidth::U32 => 4,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DatasetMeta {
    pub vocab_size: usize,
    pub token_width: TokenWidth,
    pub vocab: VocabSpec,
    pub train_tokens: usize,
    /// `None` when validation was skipped.
    pub val_tokens: Option<usize>,
    pub split_fraction: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub source: String,
}

impl DatasetMeta {
    /// Read `<dir>/meta.json`. A directory without it is not a dataset.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(META_FILE);
        let file = File::open(&path).map_err(|e| LabError::MissingDataset {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn has_validation(&self) -> bool {
        self.val_tokens.is_some()
    }
}
