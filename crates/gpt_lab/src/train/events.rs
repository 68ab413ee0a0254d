//! Progress events pushed synchronously to a subscriber by the coordinator.

use std::io::Write;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Step,
    Eval,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub step: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub lr: f64,
    pub elapsed: Duration,
    pub tokens_per_sec: f64,
}

pub trait ProgressSink {
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent),
{
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Queue interface for front-ends polling from another thread.
impl ProgressSink for Sender<ProgressEvent> {
    fn on_event(&mut self, event: &ProgressEvent) {
        if self.send(event.clone()).is_err() {
            tracing::debug!("Progress receiver dropped; event at step {} discarded", event.step);
        }
    }
}

/// Writes events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_event(&mut self, e: &ProgressEvent) {
        match e.kind {
            EventKind::Step => info!(
                "Step {:4} | Loss: {:.4} | LR: {:.7} | {:.2} tok/s | {:.1}s",
                e.step,
                e.train_loss,
                e.lr,
                e.tokens_per_sec,
                e.elapsed.as_secs_f64()
            ),
            EventKind::Eval => info!(
                "Eval {:4} | Train: {:.4} | Val: {} | LR: {:.7}",
                e.step,
                e.train_loss,
                e.val_loss.map_or("-".to_string(), |v| format!("{v:.4}")),
                e.lr
            ),
        }
    }
}

/// One JSON object per line, for front-ends that spawn the CLI.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> ProgressSink for JsonLinesSink<W> {
    fn on_event(&mut self, event: &ProgressEvent) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.writer))
            .and_then(|()| self.writer.flush());
        if let Err(e) = written {
            tracing::warn!("Failed to write progress event: {e}");
        }
    }
}

/// Forwards every event to each sink in order.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn ProgressSink + Send>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ProgressSink + Send + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ProgressSink for Fanout {
    fn on_event(&mut self, event: &ProgressEvent) {
        for sink in self.sinks.iter_mut() {
            sink.on_event(event);
        }
    }
}
