//! Tokenizer adapter: text <-> token ids.
//!
//! Two strategies share one contract ([`Tokenize`]):
//! - [`CharTokenizer`]: closed vocabulary of the distinct characters of a corpus,
//!   sorted by code point. Unknown characters are rejected.
//! - [`SubwordTokenizer`]: a pretrained `tokenizers` vocabulary (file or hub id).
//!
//! [`VocabSpec`] is the persisted form stored in `meta.json` and checkpoints.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{LabError, Result};

const EOS_CANDIDATES: [&str; 2] = ["<|endoftext|>", "</s>"];

/// Persisted vocabulary, enough to rebuild the tokenizer without the corpus.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VocabSpec {
    Char {
        /// All vocabulary characters in id order.
        chars: String,
    },
    Subword {
        identity: String,
        tokenizer_json: String,
        eos_id: Option<u32>,
    },
}

impl VocabSpec {
    pub fn vocab_size(&self) -> Result<usize> {
        match self {
            VocabSpec::Char { chars } => Ok(chars.chars().count()),
            VocabSpec::Subword { .. } => Ok(TextTokenizer::from_spec(self)?.vocab_size()),
        }
    }
}

pub trait Tokenize {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn vocab_size(&self) -> usize;
    fn eos_id(&self) -> Option<u32>;
    fn spec(&self) -> Result<VocabSpec>;
}

// ----------------------------------------------------------------------------
// Character vocabulary
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CharTokenizer {
    itos: Vec<char>,
    stoi: HashMap<char, u32>,
}

impl CharTokenizer {
    /// Vocabulary = sorted set of the distinct characters of `corpus`.
    pub fn build(corpus: &str) -> Result<Self> {
        if corpus.is_empty() {
            return Err(LabError::EmptyCorpus);
        }
        let chars: BTreeSet<char> = corpus.chars().collect();
        Ok(Self::from_chars(chars.into_iter().collect()))
    }

    fn from_chars(itos: Vec<char>) -> Self {
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();
        Self { itos, stoi }
    }

    pub fn chars(&self) -> &[char] {
        &self.itos
    }
}

impl Tokenize for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|ch| {
                self.stoi
                    .get(&ch)
                    .copied()
                    .ok_or(LabError::UnknownCharacter { ch })
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                self.itos
                    .get(id as usize)
                    .copied()
                    .ok_or(LabError::TokenOutOfRange {
                        id,
                        vocab_size: self.itos.len(),
                    })
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.itos.len()
    }

    fn eos_id(&self) -> Option<u32> {
        None
    }

    fn spec(&self) -> Result<VocabSpec> {
        Ok(VocabSpec::Char {
            chars: self.itos.iter().collect(),
        })
    }
}

// ----------------------------------------------------------------------------
// Subword vocabulary
// ----------------------------------------------------------------------------

pub struct SubwordTokenizer {
    inner: Tokenizer,
    identity: String,
    eos_id: Option<u32>,
}

impl SubwordTokenizer {
    /// `source` is a `tokenizer.json` path, a directory containing one, or a hub id.
    pub fn load(source: &str) -> Result<Self> {
        let path = Path::new(source);
        let inner = if path.is_file() {
            Tokenizer::from_file(path).map_err(LabError::tokenizer)?
        } else if path.join("tokenizer.json").is_file() {
            Tokenizer::from_file(path.join("tokenizer.json")).map_err(LabError::tokenizer)?
        } else {
            tracing::info!("Fetching tokenizer '{}' from the hub", source);
            Tokenizer::from_pretrained(source, None).map_err(LabError::tokenizer)?
        };
        Ok(Self::new(inner, source.to_string()))
    }

    fn new(inner: Tokenizer, identity: String) -> Self {
        let eos_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| inner.token_to_id(token));
        Self {
            inner,
            identity,
            eos_id,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Tokenize for SubwordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(LabError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let vocab_size = self.vocab_size();
        if let Some(&id) = ids.iter().find(|&&id| id as usize >= vocab_size) {
            return Err(LabError::TokenOutOfRange { id, vocab_size });
        }
        self.inner.decode(ids, false).map_err(LabError::tokenizer)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    fn spec(&self) -> Result<VocabSpec> {
        Ok(VocabSpec::Subword {
            identity: self.identity.clone(),
            tokenizer_json: self.inner.to_string(false).map_err(LabError::tokenizer)?,
            eos_id: self.eos_id,
        })
    }
}

// ----------------------------------------------------------------------------
// Tagged union
// ----------------------------------------------------------------------------

/// Which tokenizer strategy to build a dataset with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenizerKind {
    Char,
    Subword { source: String },
}

impl FromStr for TokenizerKind {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Err(LabError::InvalidConfig("empty tokenizer name".to_string())),
            "char" => Ok(Self::Char),
            other => Ok(Self::Subword {
                source: other.to_string(),
            }),
        }
    }
}

pub enum TextTokenizer {
    Char(CharTokenizer),
    Subword(SubwordTokenizer),
}

impl TextTokenizer {
    /// Character vocabularies are derived from `corpus`; subword ones are fixed
    /// externally and ignore it.
    pub fn build(kind: &TokenizerKind, corpus: &str) -> Result<Self> {
        match kind {
            TokenizerKind::Char => Ok(Self::Char(CharTokenizer::build(corpus)?)),
            TokenizerKind::Subword { source } => {
                let tok = SubwordTokenizer::load(source)?;
                tracing::info!(
                    "Subword vocabulary '{}' ({} tokens)",
                    tok.identity(),
                    tok.vocab_size()
                );
                Ok(Self::Subword(tok))
            }
        }
    }

    pub fn from_spec(spec: &VocabSpec) -> Result<Self> {
        match spec {
            VocabSpec::Char { chars } => Ok(Self::Char(CharTokenizer::from_chars(
                chars.chars().collect(),
            ))),
            VocabSpec::Subword {
                identity,
                tokenizer_json,
                eos_id,
            } => {
                let inner = Tokenizer::from_str(tokenizer_json).map_err(LabError::tokenizer)?;
                let mut tok = SubwordTokenizer::new(inner, identity.clone());
                if eos_id.is_some() {
                    tok.eos_id = *eos_id;
                }
                Ok(Self::Subword(tok))
            }
        }
    }

    fn inner(&self) -> &dyn Tokenize {
        match self {
            Self::Char(t) => t,
            Self::Subword(t) => t,
        }
    }
}

impl Tokenize for TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.inner().encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner().decode(ids)
    }

    fn vocab_size(&self) -> usize {
        self.inner().vocab_size()
    }

    fn eos_id(&self) -> Option<u32> {
        self.inner().eos_id()
    }

    fn spec(&self) -> Result<VocabSpec> {
        self.inner().spec()
    }
}
