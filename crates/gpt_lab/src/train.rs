//! Train Module - Training engine for GPT Lab
//!
//! - TrainArgs: CLI arguments for training
//! - context: per-run context, stop flag, run states
//! - events: progress events and subscribers
//! - workers: gradient all-reduce across worker threads
//! - training_loop: the run state machine

pub mod args;
pub mod context;
pub mod events;
pub mod training_loop;
pub mod workers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{error, info};

pub use args::TrainArgs;
pub use context::{derive_seed, RunContext, RunState, StopFlag, STOP_SIGNAL_FILE};
pub use events::{EventKind, Fanout, JsonLinesSink, LogSink, ProgressEvent, ProgressSink};
pub use training_loop::{train, RunSummary, Trainer};
pub use workers::{AllReduce, Gradients, StepPlan};

/// CLI entry point.
pub fn run(args: TrainArgs) -> anyhow::Result<()> {
    info!("--- GPT Lab Training ---");
    let ctx = args.to_context()?;

    let stop = ctx.stop.clone();
    let ctrl_c_count = Arc::new(AtomicUsize::new(0));
    let c = ctrl_c_count.clone();
    ctrlc::set_handler(move || {
        let count = c.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            info!("\n\n🛑 Ctrl+C detected! Finishing current step and saving...");
            info!("   (Press Ctrl+C again to force quit WITHOUT saving)");
            stop.request_stop();
        } else {
            error!("\n⚠️  Force quit! Exiting immediately without saving.");
            std::process::exit(1);
        }
    })?;

    let mut sink = Fanout::new().with(LogSink);
    if args.json_events {
        sink = sink.with(JsonLinesSink::new(std::io::stdout()));
    }

    let summary = train(&ctx, &mut sink)?;
    info!(
        "Run finished: {:?} at step {} (best val loss {:.4}), checkpoint {:?}",
        summary.state, summary.iter_num, summary.best_val_loss, summary.checkpoint
    );
    Ok(())
}
