//! Per-run context, cancellation flag and run states.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use candle_core::Device;

use crate::checkpoint::CHECKPOINT_FILE;
use crate::config::{ShapeOverrides, TrainConfig};

/// File name that requests a graceful stop when created in the output directory.
pub const STOP_SIGNAL_FILE: &str = "stop_signal";

/// How long the coordinator waits for all workers at the gradient barrier.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Running,
    Evaluating,
    Completed,
    Stopped,
    Failed,
}

/// Cooperative cancellation, polled at step boundaries.
#[derive(Clone, Debug, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
    signal_file: Option<PathBuf>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also trip when `path` appears on disk.
    pub fn with_signal_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.signal_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.signal_file {
            if path.exists() {
                tracing::info!("🛑 Stop signal file detected: {:?}", path);
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(
                        "Could not remove stop signal file {:?}: {}; the next run will stop too",
                        path,
                        e
                    );
                }
                self.request_stop();
                return true;
            }
        }
        false
    }
}

/// Everything one training run needs. No global session state.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub config: TrainConfig,
    pub overrides: ShapeOverrides,
    pub dataset_dir: PathBuf,
    pub out_dir: PathBuf,
    pub device: Device,
    pub stop: StopFlag,
    pub worker_timeout: Duration,
}

impl RunContext {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(config: TrainConfig, dataset_dir: P, out_dir: Q) -> Self {
        let out_dir = out_dir.as_ref().to_path_buf();
        Self {
            config,
            overrides: ShapeOverrides::all(),
            dataset_dir: dataset_dir.as_ref().to_path_buf(),
            stop: StopFlag::new().with_signal_file(out_dir.join(STOP_SIGNAL_FILE)),
            out_dir,
            device: Device::Cpu,
            worker_timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_overrides(mut self, overrides: ShapeOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.out_dir.join(CHECKPOINT_FILE)
    }
}

/// Deterministic seed from a tuple of integers (splitmix64 chain).
pub fn derive_seed(parts: &[u64]) -> u64 {
    let mut state = 0x243F_6A88_85A3_08D3u64;
    for &part in parts {
        state ^= part;
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        state = z ^ (z >> 31);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_shared_between_clones() {
        let a = StopFlag::new();
        let b = a.clone();
        assert!(!b.is_stop_requested());
        a.request_stop();
        assert!(b.is_stop_requested());
    }

    #[test]
    fn test_stop_signal_file_is_consumed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(STOP_SIGNAL_FILE);
        let flag = StopFlag::new().with_signal_file(&path);
        assert!(!flag.is_stop_requested());

        std::fs::write(&path, "")?;
        assert!(flag.is_stop_requested());
        assert!(!path.exists());
        assert!(flag.is_stop_requested());
        Ok(())
    }

    #[test]
    fn test_undeletable_signal_still_stops() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(STOP_SIGNAL_FILE);
        std::fs::create_dir(&path)?;
        let flag = StopFlag::new().with_signal_file(&path);

        assert!(flag.is_stop_requested());
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn test_derive_seed_depends_on_every_part() {
        let base = derive_seed(&[1337, 10]);
        assert_eq!(base, derive_seed(&[1337, 10]));
        assert_ne!(base, derive_seed(&[1337, 11]));
        assert_ne!(base, derive_seed(&[1338, 10]));
        assert_ne!(derive_seed(&[1337, 10, 0]), derive_seed(&[1337, 10, 1]));
    }
}
