use crate::data::PrepareArgs;
use crate::evaluate::EvaluateArgs;
use crate::inference::{CompareArgs, GenerateArgs};
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "GPT Lab: prepare, train, evaluate and sample small GPT models", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Tokenize a text corpus into train.bin / val.bin / meta.json
    Prepare(PrepareArgs),

    /// Train a model (ctrl-c stops gracefully)
    Train(TrainArgs),

    /// Evaluation-only run: validation loss under several seeds
    Evaluate(EvaluateArgs),

    /// Sample text from a checkpoint
    Generate(GenerateArgs),

    /// Sample from several checkpoints with identical settings
    Compare(CompareArgs),
}
