//! Learning-rate schedule: linear warmup, cosine decay, floor at `min_lr`.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub learning_rate: f64,
    pub min_lr: f64,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    pub decay_lr: bool,
}

impl LrSchedule {
    /// Pure function of the step number.
    pub fn lr_at(&self, step: usize) -> f64 {
        if !self.decay_lr {
            return self.learning_rate;
        }
        if step < self.warmup_iters {
            return self.learning_rate * (step + 1) as f64 / (self.warmup_iters + 1) as f64;
        }
        if step > self.lr_decay_iters {
            return self.min_lr;
        }
        let span = self.lr_decay_iters.saturating_sub(self.warmup_iters).max(1);
        let progress = ((step - self.warmup_iters) as f64 / span as f64).clamp(0.0, 1.0);
        let coeff = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.min_lr + coeff * (self.learning_rate - self.min_lr)
    }
}
