//! Training Loop - run state machine, evaluation, checkpoint policy

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Var;
use gpt_core::optim::clip_grad_norm;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use super::context::{derive_seed, RunContext, RunState};
use super::events::{EventKind, ProgressEvent, ProgressSink};
use super::workers::{AllReduce, Gradients, InlineReducer, StepPlan, WorkerPool};
use crate::checkpoint::{self, TrainingState};
use crate::config::InitMode;
use crate::data::{Dataset, Split};
use crate::error::{LabError, Result};
use crate::evaluate::{estimate_loss, eval_seed};

/// Final outcome of a run that did not fail.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub state: RunState,
    /// Optimizer steps applied so far (the step the run would continue from).
    pub iter_num: usize,
    pub best_val_loss: f32,
    pub last_train_loss: Option<f32>,
    pub checkpoint: PathBuf,
}

enum Reducer {
    Inline(InlineReducer),
    Pool(WorkerPool),
}

impl Reducer {
    fn all_reduce(&mut self, step: usize, plan: &StepPlan) -> Result<Gradients> {
        match self {
            Reducer::Inline(r) => r.all_reduce(step, plan),
            Reducer::Pool(p) => p.all_reduce(step, plan),
        }
    }

    fn shutdown(self) {
        if let Reducer::Pool(pool) = self {
            pool.shutdown();
        }
    }
}

pub struct Trainer<'a> {
    ctx: &'a RunContext,
    state: RunState,
}

impl<'a> Trainer<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("run state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the run to a terminal state. `Failed` runs return the error.
    pub fn run(&mut self, sink: &mut dyn ProgressSink) -> Result<RunSummary> {
        self.transition(RunState::Initializing);
        let result = self
            .initialize()
            .and_then(|(state, dataset)| self.run_loop(state, dataset, sink));
        if let Err(e) = &result {
            error!("Training failed: {e}");
            self.transition(RunState::Failed);
        }
        result
    }

    fn initialize(&mut self) -> Result<(TrainingState, Arc<Dataset>)> {
        let ctx = self.ctx;
        let requested = &ctx.config;
        requested.validate()?;
        info!(
            "Config: Layers={}, Heads={}, Dim={}, Context={}, Batch={}x{}x{} (workers x accum)",
            requested.n_layer,
            requested.n_head,
            requested.n_embd,
            requested.block_size,
            requested.batch_size,
            requested.num_workers,
            requested.gradient_accumulation_steps
        );

        let dataset = Dataset::open(&ctx.dataset_dir)?;
        info!(
            "Data loaded from {:?}. Train tokens: {}, Val tokens: {}",
            ctx.dataset_dir,
            dataset.train.len(),
            dataset
                .val
                .as_ref()
                .map_or("skipped".to_string(), |v| v.len().to_string())
        );
        // On resume the block size may still come from the checkpoint.
        if requested.init_from != InitMode::Resume || ctx.overrides.block_size {
            dataset.require_block(requested.block_size)?;
        }

        std::fs::create_dir_all(&ctx.out_dir)?;
        let state = checkpoint::initialize(ctx, &dataset.meta)?;
        dataset.require_block(state.config.block_size)?;

        let cfg = state.model_config();
        info!("📊 Model Size: {:.2}M Params", cfg.num_params() as f64 / 1e6);
        info!(
            "💾 Est. Memory: {:.2} MB per worker",
            cfg.estimate_train_memory_mb(state.config.batch_size)
        );
        info!("Device: {:?}", ctx.device);

        Ok((state, Arc::new(dataset)))
    }

    fn save(&self, state: &TrainingState) -> Result<()> {
        checkpoint::save(state, &self.ctx.checkpoint_path())
    }

    fn run_loop(
        &mut self,
        mut state: TrainingState,
        dataset: Arc<Dataset>,
        sink: &mut dyn ProgressSink,
    ) -> Result<RunSummary> {
        let ctx = self.ctx;
        let cfg = &state.config;
        let vars: Vec<Var> = state.optimizer.vars().iter().map(|(_, v)| v.clone()).collect();

        let mut reducer = if cfg.num_workers == 1 {
            Reducer::Inline(InlineReducer::new(
                state.model.clone(),
                vars,
                Arc::clone(&dataset),
                ctx.device.clone(),
            ))
        } else {
            Reducer::Pool(WorkerPool::spawn(
                cfg.num_workers,
                &state.model,
                &vars,
                Arc::clone(&dataset),
                &ctx.device,
                ctx.worker_timeout,
            )?)
        };

        let result = self.steps(&mut state, &dataset, &mut reducer, sink);
        reducer.shutdown();
        result
    }

    fn steps(
        &mut self,
        state: &mut TrainingState,
        dataset: &Dataset,
        reducer: &mut Reducer,
        sink: &mut dyn ProgressSink,
    ) -> Result<RunSummary> {
        let ctx = self.ctx;
        let cfg = state.config.clone();
        let schedule = cfg.schedule();
        let log_interval = cfg.log_interval.max(1);
        let tokens_per_step = cfg.tokens_per_step() as f64;
        let run_start = Instant::now();
        let mut last_train_loss = None;

        if dataset.val.is_none() {
            info!("No validation split; periodic evaluation is skipped for this run");
        }

        self.transition(RunState::Running);
        info!(
            "Starting training at step {} (target: {} steps)",
            state.iter_num, cfg.max_iters
        );

        let mut step = state.iter_num;
        loop {
            // ---- step boundary ----
            if ctx.stop.is_stop_requested() {
                info!("🛑 Stop requested. Saving checkpoint at step {}...", step);
                self.save(state)?;
                self.transition(RunState::Stopped);
                break;
            }

            if let Some(val) = dataset.val.as_ref() {
                if cfg.eval_interval > 0 && step % cfg.eval_interval == 0 {
                    self.transition(RunState::Evaluating);
                    let train_loss = estimate_loss(
                        &state.model,
                        &dataset.train,
                        cfg.eval_iters,
                        cfg.batch_size,
                        eval_seed(cfg.seed, step, Split::Train),
                        &ctx.device,
                    )?;
                    let val_loss = estimate_loss(
                        &state.model,
                        val,
                        cfg.eval_iters,
                        cfg.batch_size,
                        eval_seed(cfg.seed, step, Split::Val),
                        &ctx.device,
                    )?;
                    sink.on_event(&ProgressEvent {
                        kind: EventKind::Eval,
                        step,
                        train_loss,
                        val_loss: Some(val_loss),
                        lr: schedule.lr_at(step),
                        elapsed: run_start.elapsed(),
                        tokens_per_sec: 0.0,
                    });

                    let improved = val_loss < state.best_val_loss;
                    if improved {
                        info!("🌟 New best val loss: {:.4}", val_loss);
                        state.best_val_loss = val_loss;
                    }
                    if step > 0 && (improved || cfg.always_save_checkpoint) {
                        self.save(state)?;
                    }
                    self.transition(RunState::Running);
                }
            }

            if step >= cfg.max_iters {
                info!("Training complete at step {}. Saving final checkpoint...", step);
                self.save(state)?;
                self.transition(RunState::Completed);
                break;
            }

            // ---- one optimizer step ----
            let lr = schedule.lr_at(step);
            state.optimizer.set_learning_rate(lr);

            let mut rng = StdRng::seed_from_u64(derive_seed(&[cfg.seed, step as u64]));
            let plan = StepPlan {
                starts: dataset
                    .train
                    .sample_starts(&mut rng, cfg.sequences_per_step(), cfg.block_size),
                accum_steps: cfg.gradient_accumulation_steps,
                num_workers: cfg.num_workers,
                batch_size: cfg.batch_size,
            };

            let step_start = Instant::now();
            let Gradients { mut grads, loss } = reducer.all_reduce(step, &plan)?;
            let grad_norm = clip_grad_norm(&mut grads, cfg.grad_clip)?;
            if let Err(e) = check_finite(step, loss).and_then(|()| check_grad_norm(step, grad_norm)) {
                warn!("{e}; saving the last finite state");
                self.save(state)?;
                return Err(e);
            }
            state.optimizer.step(&grads)?;
            last_train_loss = Some(loss);

            let done = step;
            step += 1;
            state.iter_num = step;

            if done % log_interval == 0 {
                let dt = step_start.elapsed().max(Duration::from_micros(1));
                sink.on_event(&ProgressEvent {
                    kind: EventKind::Step,
                    step: done,
                    train_loss: loss,
                    val_loss: None,
                    lr,
                    elapsed: run_start.elapsed(),
                    tokens_per_sec: tokens_per_step / dt.as_secs_f64(),
                });
            }

            if cfg.save_interval > 0 && step % cfg.save_interval == 0 {
                self.save(state)?;
            }
        }

        Ok(RunSummary {
            state: self.state,
            iter_num: state.iter_num,
            best_val_loss: state.best_val_loss,
            last_train_loss,
            checkpoint: ctx.checkpoint_path(),
        })
    }
}

fn check_finite(step: usize, loss: f32) -> Result<()> {
    if loss.is_finite() {
        Ok(())
    } else {
        Err(LabError::NonFiniteLoss { step, loss })
    }
}

fn check_grad_norm(step: usize, norm: f64) -> Result<()> {
    if norm.is_finite() {
        Ok(())
    } else {
        Err(LabError::NonFiniteGradient { step, norm })
    }
}

/// Run training for `ctx` to completion (or stop), pushing progress to `sink`.
pub fn train(ctx: &RunContext, sink: &mut dyn ProgressSink) -> Result<RunSummary> {
    Trainer::new(ctx).run(sink)
}
