//! GPT Core Engine
//!
//! Model, optimizer and sampling primitives for the GPT Lab toolchain.
//! Everything here is device-agnostic candle code; dataset handling,
//! checkpoints and the training loop live in `gpt_lab`.

pub mod device_utils;
pub mod layers;
pub mod model;
pub mod optim;
pub mod sampling;
pub mod schedule;

#[cfg(test)]
mod tests;

pub use model::{Block, Gpt, GptConfig};
pub use optim::{AdamW, ParamsAdamW};
pub use sampling::Sampler;
pub use schedule::LrSchedule;
