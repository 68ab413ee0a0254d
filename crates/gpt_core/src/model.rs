//! Model Module - GPT model architecture
//!
//! - GptConfig: model shape (vocab, context, layers, heads, width)
//! - Block: pre-norm transformer block (attention + MLP)
//! - Gpt: embeddings, blocks, final norm and tied LM head
//! - init: seeded parameter initialization

pub mod block;
pub mod config;
pub mod gpt;
pub mod init;

pub use block::Block;
pub use config::GptConfig;
pub use gpt::Gpt;
