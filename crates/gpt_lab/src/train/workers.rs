//! Gradient computation and all-reduce across cooperating workers.
//!
//! The coordinator splits each optimizer step into a [`StepPlan`]; every
//! worker computes gradients for its contiguous shard of each micro-batch and
//! the coordinator averages the replies in worker order. With a single worker
//! the computation runs inline.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use candle_core::{Device, Tensor, Var};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gpt_core::Gpt;

use crate::data::Dataset;
use crate::error::{LabError, Result};

/// Window starts of one optimizer step, laid out as
/// `[accum][worker][batch]` in a flat vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepPlan {
    pub starts: Vec<usize>,
    pub accum_steps: usize,
    pub num_workers: usize,
    pub batch_size: usize,
}

impl StepPlan {
    /// For each accumulation step, the starts assigned to `worker`.
    pub fn shard(&self, worker: usize) -> Vec<Vec<usize>> {
        let micro = self.num_workers * self.batch_size;
        (0..self.accum_steps)
            .map(|a| {
                let from = a * micro + worker * self.batch_size;
                self.starts[from..from + self.batch_size].to_vec()
            })
            .collect()
    }
}

/// Gradients (one per trainable variable) and the mean training loss.
pub struct Gradients {
    pub grads: Vec<Tensor>,
    pub loss: f32,
}

/// Averages gradients across all workers for one step.
pub trait AllReduce {
    fn all_reduce(&mut self, step: usize, plan: &StepPlan) -> Result<Gradients>;
}

/// Forward/backward over `shards`, each loss scaled by `1 / shards.len()`.
pub fn shard_gradients(
    model: &Gpt,
    vars: &[Var],
    dataset: &Dataset,
    shards: &[Vec<usize>],
    device: &Device,
) -> Result<Gradients> {
    let block_size = model.config.block_size;
    let scale = 1.0 / shards.len() as f64;
    let mut acc: Vec<Option<Tensor>> = vec![None; vars.len()];
    let mut loss_sum = 0f32;

    for starts in shards {
        let (x, y) = dataset.train.batch(starts, block_size, device)?;
        let loss = (model.loss(&x, &y, true)? * scale)?;
        loss_sum += loss.to_scalar::<f32>()?;
        let store = loss.backward()?;
        for (slot, var) in acc.iter_mut().zip(vars) {
            if let Some(g) = store.get(var.as_tensor()) {
                *slot = Some(match slot.take() {
                    Some(prev) => (prev + g)?,
                    None => g.clone(),
                });
            }
        }
    }

    let grads = acc
        .into_iter()
        .zip(vars)
        .map(|(g, var)| match g {
            Some(g) => Ok(g),
            None => var.as_tensor().zeros_like(),
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Gradients {
        grads,
        loss: loss_sum,
    })
}

/// Element-wise mean of per-worker gradients, summed in the given order.
pub fn average(parts: Vec<Gradients>) -> Result<Gradients> {
    let n = parts.len();
    let mut iter = parts.into_iter();
    let Some(first) = iter.next() else {
        return Err(LabError::InvalidConfig("no gradients to average".to_string()));
    };
    if n == 1 {
        return Ok(first);
    }
    let mut grads = first.grads;
    let mut loss = first.loss;
    for part in iter {
        for (acc, g) in grads.iter_mut().zip(part.grads) {
            *acc = (&*acc + g)?;
        }
        loss += part.loss;
    }
    let grads = grads
        .into_iter()
        .map(|g| g / n as f64)
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Gradients {
        grads,
        loss: loss / n as f32,
    })
}

/// Single-worker runs: compute on the coordinator thread.
pub struct InlineReducer {
    model: Gpt,
    vars: Vec<Var>,
    dataset: Arc<Dataset>,
    device: Device,
}

impl InlineReducer {
    pub fn new(model: Gpt, vars: Vec<Var>, dataset: Arc<Dataset>, device: Device) -> Self {
        Self {
            model,
            vars,
            dataset,
            device,
        }
    }
}

impl AllReduce for InlineReducer {
    fn all_reduce(&mut self, _step: usize, plan: &StepPlan) -> Result<Gradients> {
        let mut parts = Vec::with_capacity(plan.num_workers);
        for w in 0..plan.num_workers {
            parts.push(shard_gradients(
                &self.model,
                &self.vars,
                &self.dataset,
                &plan.shard(w),
                &self.device,
            )?);
        }
        average(parts)
    }
}

struct Job {
    step: usize,
    shards: Vec<Vec<usize>>,
}

struct Reply {
    worker: usize,
    step: usize,
    result: Result<Gradients>,
}

/// One coordinator, `n` worker threads. Workers share the model parameters
/// (read-only between optimizer steps) and the memory-mapped dataset.
pub struct WorkerPool {
    jobs: Vec<Sender<Job>>,
    replies: Receiver<Reply>,
    handles: Vec<JoinHandle<()>>,
    timeout: Duration,
}

impl WorkerPool {
    pub fn spawn(
        num_workers: usize,
        model: &Gpt,
        vars: &[Var],
        dataset: Arc<Dataset>,
        device: &Device,
        timeout: Duration,
    ) -> Result<Self> {
        let (reply_tx, replies) = crossbeam_channel::unbounded::<Reply>();
        let mut jobs = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for worker in 0..num_workers {
            let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
            let model = model.clone();
            let vars = vars.to_vec();
            let dataset = Arc::clone(&dataset);
            let device = device.clone();
            let reply_tx = reply_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("gpt-worker-{worker}"))
                .spawn(move || {
                    for job in job_rx.iter() {
                        let result = shard_gradients(&model, &vars, &dataset, &job.shards, &device);
                        let reply = Reply {
                            worker,
                            step: job.step,
                            result,
                        };
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    tracing::debug!("worker {worker} exiting");
                })?;
            jobs.push(job_tx);
            handles.push(handle);
        }
        tracing::info!("Started {} training workers", num_workers);

        Ok(Self {
            jobs,
            replies,
            handles,
            timeout,
        })
    }

    /// Close the job queues and join the workers. A worker that does not
    /// finish within the barrier timeout is detached.
    pub fn shutdown(mut self) {
        self.jobs.clear();
        let deadline = Instant::now() + self.timeout;
        for (worker, handle) in self.handles.drain(..).enumerate() {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if !handle.is_finished() {
                tracing::warn!("worker {worker} did not stop in time; detaching");
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("worker {worker} panicked");
            }
        }
    }
}

impl AllReduce for WorkerPool {
    fn all_reduce(&mut self, step: usize, plan: &StepPlan) -> Result<Gradients> {
        for (worker, tx) in self.jobs.iter().enumerate() {
            let job = Job {
                step,
                shards: plan.shard(worker),
            };
            tx.send(job).map_err(|_| LabError::WorkerSync {
                worker,
                reason: "worker disconnected before receiving its shard".to_string(),
            })?;
        }

        let deadline = Instant::now() + self.timeout;
        let mut slots: Vec<Option<Gradients>> = (0..self.jobs.len()).map(|_| None).collect();
        for _ in 0..self.jobs.len() {
            let reply = match self.replies.recv_deadline(deadline) {
                Ok(reply) => reply,
                Err(e) => {
                    let worker = slots.iter().position(Option::is_none).unwrap_or(0);
                    let reason = match e {
                        RecvTimeoutError::Timeout => {
                            format!("no reply within {:?} at step {step}", self.timeout)
                        }
                        RecvTimeoutError::Disconnected => "worker disconnected".to_string(),
                    };
                    return Err(LabError::WorkerSync { worker, reason });
                }
            };
            if reply.step != step {
                return Err(LabError::WorkerSync {
                    worker: reply.worker,
                    reason: format!("reply for step {} while waiting for step {step}", reply.step),
                });
            }
            match reply.result {
                Ok(grads) => slots[reply.worker] = Some(grads),
                Err(e) => {
                    return Err(LabError::WorkerSync {
                        worker: reply.worker,
                        reason: e.to_string(),
                    })
                }
            }
        }

        average(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shards_are_contiguous_per_micro_batch() {
        let plan = StepPlan {
            starts: (0..12).collect(),
            accum_steps: 2,
            num_workers: 3,
            batch_size: 2,
        };
        assert_eq!(plan.shard(0), vec![vec![0, 1], vec![6, 7]]);
        assert_eq!(plan.shard(1), vec![vec![2, 3], vec![8, 9]]);
        assert_eq!(plan.shard(2), vec![vec![4, 5], vec![10, 11]]);
    }

    #[test]
    fn test_average_is_elementwise_mean() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let a = Gradients {
            grads: vec![Tensor::new(&[1f32, 2.0], &device)?],
            loss: 1.0,
        };
        let b = Gradients {
            grads: vec![Tensor::new(&[3f32, 6.0], &device)?],
            loss: 3.0,
        };
        let avg = average(vec![a, b])?;
        assert_eq!(avg.grads[0].to_vec1::<f32>()?, vec![2.0, 4.0]);
        assert_eq!(avg.loss, 2.0);
        Ok(())
    }
}
