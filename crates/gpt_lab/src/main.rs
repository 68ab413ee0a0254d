use anyhow::Result;
use clap::Parser;
use gpt_lab::cli::{Cli, Commands};
use gpt_lab::{data, evaluate, inference, train, LabError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Console on stderr (stdout carries JSON events and samples), plus a daily
/// rolling file under `logs/`.
fn init_logging() -> WorkerGuard {
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily("logs", "gpt_lab.log"));
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    guard
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Unknown panic");
        let at = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        tracing::error!(target: "panic", "🔥 CRASH at {}: {}", at, msg);
        eprintln!("🔥 CRASH at {}: {}", at, msg);
    }));
}

fn main() -> Result<()> {
    let _guard = init_logging();
    install_panic_hook();

    let result = match Cli::parse().command {
        Commands::Prepare(args) => data::run(args),
        Commands::Train(args) => train::run(args),
        Commands::Evaluate(args) => evaluate::run(args),
        Commands::Generate(args) => inference::run_generate(args),
        Commands::Compare(args) => inference::run_compare(args),
    };

    if let Err(e) = &result {
        match e.downcast_ref::<LabError>() {
            Some(err) => tracing::error!("{}: {}", err.kind(), err),
            None => tracing::error!("{e:#}"),
        }
    }
    result
}
