//! GPT Lab
//!
//! Data pipeline, checkpoint store, training engine and inference for small
//! GPT models built on `gpt_core`.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod inference;
pub mod tokenizer;
pub mod train;

pub use config::{InitMode, Preset, ShapeOverrides, TrainConfig};
pub use error::{LabError, Result};
