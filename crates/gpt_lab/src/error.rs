//! Error taxonomy for the data pipeline, checkpoint store and training engine.
//!
//! Every variant carries the concrete offending values so a front-end can
//! render an actionable message without parsing strings.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum LabError {
    #[error("Empty corpus: cannot build a vocabulary from empty text")]
    EmptyCorpus,

    #[error("Dataset too small: minimum dataset({split}) size is {min}, but block size is {block_size}. Either reduce block size or add more data.")]
    DatasetTooSmall {
        split: String,
        /// Actual number of tokens in the split.
        size: usize,
        /// Required minimum, `block_size + 1`.
        min: usize,
        block_size: usize,
    },

    #[error("Incompatible config on resume: '{field}' is {checkpoint} in the checkpoint but {requested} was requested")]
    IncompatibleConfig {
        field: String,
        checkpoint: String,
        requested: String,
    },

    #[error("Unsupported pretrained source '{source_id}': {reason}")]
    UnsupportedSource { source_id: String, reason: String },

    #[error("Non-finite loss {loss} at step {step}")]
    NonFiniteLoss { step: usize, loss: f32 },

    #[error("Non-finite gradient norm {norm} at step {step}")]
    NonFiniteGradient { step: usize, norm: f64 },

    #[error("Checkpoint corrupt at {}: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Worker {worker} failed to reach the synchronization barrier: {reason}")]
    WorkerSync { worker: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown character {ch:?} is not in the character vocabulary")]
    UnknownCharacter { ch: char },

    #[error("Token id {id} is out of range for vocabulary size {vocab_size}")]
    TokenOutOfRange { id: u32, vocab_size: usize },

    #[error("Dataset not found at {}: {reason}", path.display())]
    MissingDataset { path: PathBuf, reason: String },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LabError>;

impl LabError {
    /// Stable kind name for front-ends and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyCorpus => "EmptyCorpusError",
            Self::DatasetTooSmall { .. } => "DatasetTooSmallError",
            Self::IncompatibleConfig { .. } => "IncompatibleConfigError",
            Self::UnsupportedSource { .. } => "UnsupportedSourceError",
            Self::NonFiniteLoss { .. } => "NonFiniteLossError",
            Self::NonFiniteGradient { .. } => "NonFiniteGradientError",
            Self::CheckpointCorrupt { .. } => "CheckpointCorruptError",
            Self::WorkerSync { .. } => "WorkerSyncError",
            Self::InvalidConfig(_) => "InvalidConfigError",
            Self::UnknownCharacter { .. } => "UnknownCharacterError",
            Self::TokenOutOfRange { .. } => "TokenOutOfRangeError",
            Self::MissingDataset { .. } => "MissingDatasetError",
            Self::Tokenizer(_) => "TokenizerError",
            Self::Candle(_) => "CandleError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }

    pub(crate) fn tokenizer<E: std::fmt::Display>(e: E) -> Self {
        Self::Tokenizer(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_too_small_message_is_verbatim() {
        let err = LabError::DatasetTooSmall {
            split: "val".to_string(),
            size: 147,
            min: 513,
            block_size: 512,
        };
        assert_eq!(
            err.to_string(),
            "Dataset too small: minimum dataset(val) size is 513, but block size is 512. Either reduce block size or add more data."
        );
        assert_eq!(err.kind(), "DatasetTooSmallError");
    }
}
