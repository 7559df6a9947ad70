//! Distillation training loop.
//!
//! One [`Trainer`] runs per worker. Each step:
//!
//! 1. **Forward**: teacher (no gradient) and student on the next batch.
//! 2. **Backward**: gradients of the combined loss for every trainable
//!    student parameter.
//! 3. **GradientSync**: one all-reduce carries the per-worker status flags,
//!    loss values, draw counters and gradients. Workers whose batch failed
//!    contribute zeros and the mean is rescaled by the number of workers that
//!    succeeded, so every worker applies the same update.
//! 4. **OptimizerStep**: global-norm clipping, then AdamW with the scheduled
//!    learning rate.
//!
//! Evaluation and checkpointing happen on the primary worker at their
//! configured cadence. A final checkpoint is always written, including when
//! a shutdown is requested.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Tensor};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use distilspeech_core::{trainable_vars, GenerationParams, Seq2SeqModel};

use crate::checkpoint::{self, CheckpointManifest, CheckpointStore};
use crate::collate::Batch;
use crate::config::DistillConfig;
use crate::error::{DistillError, DistillResult};
use crate::loss::{DistillLoss, LossBreakdown, LossEngine};
use crate::metrics::MetricsSink;
use crate::optim::{clip_grad_norm, AdamW};
use crate::pipeline::{BatchStream, DataPipeline, PipelineContext, PipelineStats, Prefetcher};
use crate::schedule::LrSchedule;
use crate::sync::{flatten_tensors, unflatten_like, GradientSync};
use crate::wer::word_errors;

/// Status slots at the front of the all-reduce buffer.
const SLOT_OK: usize = 0;
const SLOT_STOP: usize = 1;
const SLOT_DONE: usize = 2;
const SLOT_DIVERGED: usize = 3;
const SLOT_TOTAL: usize = 4;
const SLOT_CE: usize = 5;
const SLOT_KL: usize = 6;
const HEADER_LEN: usize = 7;

/// Draw counters travel as two exact-in-f32 halves.
const DRAW_SPLIT: u64 = 1 << 20;

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainPhase {
    Idle,
    Forward,
    Backward,
    GradientSync,
    OptimizerStep,
    Checkpoint,
    Eval,
}

/// Progress of the run, persisted in every checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Optimizer steps applied.
    pub step: u64,
    pub epoch: u64,
    /// Pipeline draws consumed per rank.
    pub rank_draws: Vec<u64>,
    pub learning_rate: f64,
    pub last_loss: Option<LossBreakdown>,
    pub skipped_batches: u64,
    pub last_checkpoint_step: Option<u64>,
}

/// Evaluation results; losses are averaged over target tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub step: u64,
    pub loss: f64,
    pub ce: f64,
    pub kl: f64,
    /// Corpus WER in percent, when generation is enabled and references exist.
    pub wer: Option<f64>,
    pub batches: usize,
    pub examples: usize,
}

/// Summary returned after training completes.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub total_steps: u64,
    pub final_loss: Option<f32>,
    pub skipped_batches: u64,
    pub elapsed_secs: f64,
    pub stopped_early: bool,
    pub last_checkpoint: Option<PathBuf>,
    pub last_eval: Option<EvalReport>,
    pub pipeline: PipelineStats,
}

struct StepReport {
    breakdown: LossBreakdown,
    grad_norm: f64,
    lr: f64,
    workers_ok: usize,
}

enum StepOutcome {
    Applied(StepReport),
    Skipped,
}

/// Group-wide flags agreed on at the end of a step.
struct Signals {
    stop: bool,
    done: bool,
}

// ── Trainer ───────────────────────────────────────────────────────────────────

/// Everything a [`Trainer`] is built from.
pub struct TrainerParts {
    pub config: DistillConfig,
    pub teacher: Box<dyn Seq2SeqModel>,
    pub student: Box<dyn Seq2SeqModel>,
    pub train: DataPipeline,
    pub eval: Option<DataPipeline>,
    pub context: PipelineContext,
    pub sync: Box<dyn GradientSync>,
    pub metrics: Box<dyn MetricsSink>,
    /// Set from outside (e.g. on Ctrl-C) to stop after the current step.
    pub shutdown: Arc<AtomicBool>,
}

pub struct Trainer {
    config: DistillConfig,
    teacher: Box<dyn Seq2SeqModel>,
    student: Box<dyn Seq2SeqModel>,
    train: Option<DataPipeline>,
    eval: Option<DataPipeline>,
    context: PipelineContext,
    sync: Box<dyn GradientSync>,
    metrics: Box<dyn MetricsSink>,
    shutdown: Arc<AtomicBool>,
    optimizer: AdamW,
    schedule: LrSchedule,
    engine: LossEngine,
    store: CheckpointStore,
    fingerprint: String,
    state: TrainingState,
    phase: TrainPhase,
    show_progress: bool,
}

impl Trainer {
    pub fn new(parts: TrainerParts) -> DistillResult<Self> {
        let TrainerParts { config, teacher, mut student, train, eval, context, sync, metrics, shutdown } = parts;
        config.validate()?;
        let t = &config.training;

        if t.gradient_checkpointing && !student.set_gradient_checkpointing(true) {
            warn!("Student does not support gradient checkpointing; continuing without it");
        }

        let vars = trainable_vars(student.as_ref(), t.freeze_encoder);
        if vars.is_empty() {
            return Err(DistillError::invalid("student", "the student has no trainable parameters"));
        }
        let n_params: usize = vars.iter().map(|(_, v)| v.elem_count()).sum();
        info!(
            rank = sync.rank(),
            world_size = sync.world_size(),
            tensors = vars.len(),
            params = n_params,
            freeze_encoder = t.freeze_encoder,
            "Trainer initialised"
        );

        let optimizer = AdamW::new(vars, t.adam_params())?;
        let schedule = t.schedule();
        let engine = LossEngine::new(DistillLoss::new(config.loss.clone()), t.freeze_encoder);
        let store = CheckpointStore::new(&config.checkpoint.output_dir, config.checkpoint.save_total_limit);
        let fingerprint = config.fingerprint();
        let state = TrainingState {
            step: 0,
            epoch: 0,
            rank_draws: vec![0; sync.world_size()],
            learning_rate: schedule.lr_at(0),
            last_loss: None,
            skipped_batches: 0,
            last_checkpoint_step: None,
        };

        Ok(Self {
            config,
            teacher,
            student,
            train: Some(train),
            eval,
            context,
            sync,
            metrics,
            shutdown,
            optimizer,
            schedule,
            engine,
            store,
            fingerprint,
            state,
            phase: TrainPhase::Idle,
            show_progress: true,
        })
    }

    /// Draw a progress bar on the primary worker (on by default).
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn student(&self) -> &dyn Seq2SeqModel {
        self.student.as_ref()
    }

    /// Train until `max_steps`, the last epoch, or a shutdown request.
    pub fn run(&mut self) -> DistillResult<TrainingSummary> {
        let start = Instant::now();
        let mut pipeline = self
            .train
            .take()
            .ok_or_else(|| DistillError::PipelineClosed("the training pipeline was already consumed".into()))?;

        if let Some(target) = self.config.checkpoint.resume_from_checkpoint.clone() {
            self.resume(&target)?;
            let rank = self.sync.rank();
            pipeline.fast_forward(self.state.rank_draws.get(rank).copied().unwrap_or(0))?;
        }

        let depth = self.config.data.prefetch_batches;
        let mut stream: Box<dyn BatchStream> = if depth > 0 {
            Box::new(Prefetcher::spawn(pipeline, depth)?)
        } else {
            Box::new(pipeline)
        };

        let t = self.config.training.clone();
        let pb = self.progress_bar(t.max_steps);
        pb.set_position(self.state.step);

        let mut stopped_early = false;
        let mut last_eval = None;
        let mut last_eval_step = None;

        info!(start_step = self.state.step, max_steps = t.max_steps, "Starting distillation");

        loop {
            if t.max_steps > 0 && self.state.step >= t.max_steps {
                break;
            }
            self.phase = TrainPhase::Idle;
            let batch = stream.next_batch()?;
            if batch.is_none() && self.sync.world_size() == 1 {
                break;
            }

            let (outcome, signals) = self.train_step(batch.as_ref())?;
            if let Some(b) = &batch {
                self.state.epoch = b.epoch;
            }

            match outcome {
                StepOutcome::Applied(report) => {
                    self.state.step += 1;
                    self.state.learning_rate = report.lr;
                    self.state.last_loss = Some(report.breakdown);
                    let step = self.state.step;

                    pb.inc(1);
                    pb.set_message(format!(
                        "epoch {} loss {:.4} lr {:.2e}",
                        self.state.epoch, report.breakdown.total, report.lr
                    ));

                    if t.logging_steps > 0 && step % t.logging_steps == 0 {
                        self.log_train(&report, stream.as_ref())?;
                    }
                    if t.eval_steps > 0 && step % t.eval_steps == 0 {
                        last_eval = self.evaluate_synced()?.or(last_eval);
                        last_eval_step = Some(step);
                    }
                    let save_steps = self.config.checkpoint.save_steps;
                    if save_steps > 0 && step % save_steps == 0 {
                        self.save_checkpoint()?;
                    }
                }
                StepOutcome::Skipped if !signals.done => {
                    self.state.skipped_batches += 1;
                    warn!(
                        step = self.state.step,
                        skipped = self.state.skipped_batches,
                        "No worker produced gradients; step skipped"
                    );
                }
                StepOutcome::Skipped => {}
            }

            if signals.stop {
                info!(step = self.state.step, "Shutdown requested; stopping after this step");
                stopped_early = true;
                break;
            }
            if signals.done {
                info!(step = self.state.step, "A worker ran out of data; stopping");
                break;
            }
        }
        let pipeline_stats = stream.stats();
        drop(stream);

        if self.state.last_checkpoint_step != Some(self.state.step) {
            self.save_checkpoint()?;
        }
        // every rank must agree, and only the primary holds an eval pipeline
        let eval_configured = self.config.data.eval_dataset_name.is_some() || self.eval.is_some();
        if !stopped_early && eval_configured && last_eval_step != Some(self.state.step) {
            last_eval = self.evaluate_synced()?.or(last_eval);
        }
        self.metrics.flush()?;
        self.phase = TrainPhase::Idle;

        let final_loss = self.state.last_loss.map(|l| l.total);
        pb.finish_with_message(match final_loss {
            Some(loss) => format!("Training complete, final loss {loss:.4}"),
            None => "Training complete".to_string(),
        });

        let elapsed = start.elapsed().as_secs_f64();
        info!(
            steps = self.state.step,
            skipped = self.state.skipped_batches,
            elapsed = %format_duration(elapsed as u64),
            stopped_early,
            "Distillation finished"
        );

        Ok(TrainingSummary {
            total_steps: self.state.step,
            final_loss,
            skipped_batches: self.state.skipped_batches,
            elapsed_secs: elapsed,
            stopped_early,
            last_checkpoint: self.state.last_checkpoint_step.map(|s| self.store.path_for(s)),
            last_eval,
            pipeline: pipeline_stats,
        })
    }

    // ── Step ──────────────────────────────────────────────────────────────────

    /// One synchronised step. `batch` is `None` when this worker has no data
    /// left; it still takes part in the all-reduce.
    fn train_step(&mut self, batch: Option<&Batch>) -> DistillResult<(StepOutcome, Signals)> {
        let step = self.state.step;
        let world = self.sync.world_size();
        let rank = self.sync.rank();

        let mut diverged = None;
        let local = match batch {
            Some(b) => match self.compute_gradients(b, step) {
                Ok(v) => Some(v),
                Err(DistillError::LossDivergence { value, .. }) => {
                    error!(step, rank, value, "Loss diverged");
                    diverged = Some(value);
                    None
                }
                Err(e) if e.is_fatal() && !matches!(e, DistillError::Candle(_) | DistillError::Core(_)) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!(step, rank, error = %e, "Batch failed; skipping it");
                    None
                }
            },
            None => None,
        };
        let draws_local = batch.map(|b| b.drawn_through).unwrap_or(self.state.rank_draws[rank]);

        self.phase = TrainPhase::GradientSync;
        let mut header = [0f32; HEADER_LEN];
        header[SLOT_OK] = f32::from(u8::from(local.is_some()));
        header[SLOT_STOP] = f32::from(u8::from(self.shutdown.load(Ordering::Relaxed)));
        header[SLOT_DONE] = f32::from(u8::from(batch.is_none()));
        header[SLOT_DIVERGED] = f32::from(u8::from(diverged.is_some()));
        if let Some((breakdown, _)) = &local {
            header[SLOT_TOTAL] = breakdown.total;
            header[SLOT_CE] = breakdown.ce;
            header[SLOT_KL] = breakdown.kl;
        }

        let (header, grads) = if world == 1 {
            self.state.rank_draws[0] = draws_local;
            (header, local.map(|(_, g)| g))
        } else {
            self.all_reduce_step(header, local.map(|(_, g)| g), draws_local)?
        };

        let n_ok = (header[SLOT_OK] * world as f32).round() as usize;
        let signals = Signals { stop: header[SLOT_STOP] > 0.0, done: header[SLOT_DONE] > 0.0 };

        if header[SLOT_DIVERGED] > 0.0 {
            return Err(DistillError::LossDivergence { step, value: diverged.unwrap_or(f32::NAN) });
        }
        let Some(mut grads) = grads.filter(|_| n_ok > 0) else {
            return Ok((StepOutcome::Skipped, signals));
        };

        let scale = world as f32 / n_ok as f32;
        let breakdown = LossBreakdown {
            total: header[SLOT_TOTAL] * scale,
            ce: header[SLOT_CE] * scale,
            kl: header[SLOT_KL] * scale,
        };

        self.phase = TrainPhase::OptimizerStep;
        let grad_norm = clip_grad_norm(&mut grads, self.config.training.max_grad_norm)?;
        let lr = self.schedule.lr_at(step);
        self.optimizer.step(&grads, lr)?;
        debug!(step, rank, loss = breakdown.total, grad_norm, lr, workers_ok = n_ok, "Optimizer step");

        Ok((StepOutcome::Applied(StepReport { breakdown, grad_norm, lr, workers_ok: n_ok }), signals))
    }

    fn compute_gradients(&mut self, batch: &Batch, step: u64) -> DistillResult<(LossBreakdown, Vec<Tensor>)> {
        self.phase = TrainPhase::Forward;
        let tensors = batch.to_tensors(self.student.device(), self.student.dtype())?;
        let output = self.engine.forward(self.teacher.as_mut(), self.student.as_mut(), &tensors, step)?;

        self.phase = TrainPhase::Backward;
        let store = output.loss.backward()?;
        let mut grads = Vec::with_capacity(self.optimizer.vars().len());
        for (_, var) in self.optimizer.vars() {
            let g = match store.get(var.as_tensor()) {
                Some(g) => g.to_dtype(DType::F32)?,
                None => var.as_tensor().zeros_like()?.to_dtype(DType::F32)?,
            };
            grads.push(g);
        }
        Ok((output.breakdown, grads))
    }

    /// Average header, draw counters and gradients across the group.
    ///
    /// Buffer layout: `header ++ draw slots (2 per rank) ++ gradients`. A
    /// worker without gradients sends zeros in their place.
    fn all_reduce_step(
        &mut self,
        header: [f32; HEADER_LEN],
        grads: Option<Vec<Tensor>>,
        draws_local: u64,
    ) -> DistillResult<([f32; HEADER_LEN], Option<Vec<Tensor>>)> {
        let world = self.sync.world_size();
        let rank = self.sync.rank();
        let like: Vec<Tensor> = self.optimizer.vars().iter().map(|(_, v)| v.as_tensor().clone()).collect();
        let n_grad: usize = like.iter().map(|t| t.elem_count()).sum();

        let mut flat = Vec::with_capacity(HEADER_LEN + 2 * world + n_grad);
        flat.extend_from_slice(&header);
        let draws_at = flat.len();
        flat.resize(draws_at + 2 * world, 0.0);
        flat[draws_at + 2 * rank] = (draws_local / DRAW_SPLIT) as f32;
        flat[draws_at + 2 * rank + 1] = (draws_local % DRAW_SPLIT) as f32;
        match &grads {
            Some(g) => flat.extend(flatten_tensors(g)?),
            None => flat.resize(flat.len() + n_grad, 0.0),
        }

        self.sync.all_reduce_mean(&mut flat)?;

        let mut reduced = [0f32; HEADER_LEN];
        reduced.copy_from_slice(&flat[..HEADER_LEN]);
        for r in 0..world {
            let hi = (flat[draws_at + 2 * r] * world as f32).round() as u64;
            let lo = (flat[draws_at + 2 * r + 1] * world as f32).round() as u64;
            self.state.rank_draws[r] = hi * DRAW_SPLIT + lo;
        }

        let n_ok = (reduced[SLOT_OK] * world as f32).round() as usize;
        if n_ok == 0 {
            return Ok((reduced, None));
        }
        let scale = world as f64 / n_ok as f64;
        let grads = unflatten_like(&flat[draws_at + 2 * world..], &like)?
            .into_iter()
            .map(|g| g * scale)
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((reduced, Some(grads)))
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Evaluate on the primary worker while the others wait.
    fn evaluate_synced(&mut self) -> DistillResult<Option<EvalReport>> {
        let report = if self.sync.is_primary() { self.evaluate()? } else { None };
        self.sync.barrier()?;
        Ok(report)
    }

    /// Loss (and optionally greedy-decoding WER) on the evaluation set.
    pub fn evaluate(&mut self) -> DistillResult<Option<EvalReport>> {
        let Some(eval) = self.eval.as_mut() else {
            return Ok(None);
        };
        self.phase = TrainPhase::Eval;
        eval.reset()?;

        let t = &self.config.training;
        let step = self.state.step;
        let device = self.student.device().clone();
        let dtype = self.student.dtype();
        let special = self.context.special;
        let params = GenerationParams {
            max_new_tokens: t.generation_max_new_tokens,
            eos_token_id: special.end_of_text,
            max_length: self.config.preprocess.max_label_length,
        };
        let max_batches = t.max_eval_batches.unwrap_or(usize::MAX);

        let (mut loss_sum, mut ce_sum, mut kl_sum, mut tokens) = (0f64, 0f64, 0f64, 0f64);
        let (mut errors, mut words) = (0usize, 0usize);
        let (mut batches, mut examples) = (0usize, 0usize);

        while batches < max_batches {
            let Some(batch) = eval.next_batch()? else {
                break;
            };
            let tensors = batch.to_tensors(&device, dtype)?;
            let out = self.engine.forward(self.teacher.as_mut(), self.student.as_mut(), &tensors, step)?;
            let n = batch.num_target_tokens() as f64;
            loss_sum += out.breakdown.total as f64 * n;
            ce_sum += out.breakdown.ce as f64 * n;
            kl_sum += out.breakdown.kl as f64 * n;
            tokens += n;

            if t.eval_generate {
                for i in 0..batch.batch_size {
                    let Some(reference) = &batch.references[i] else {
                        continue;
                    };
                    let features = batch.row_features(i, &device, dtype)?;
                    let ids = self.student.generate(&features, &batch.generation_prompts[i], &params)?;
                    let text_ids: Vec<u32> = ids.into_iter().filter(|&id| !special.is_timestamp(id)).collect();
                    let hypothesis = self.context.tokenizer.decode(&text_ids, true)?;
                    let normalizer = &self.context.normalizer;
                    let (e, w) = word_errors(&normalizer.normalize(reference), &normalizer.normalize(&hypothesis));
                    errors += e;
                    words += w;
                }
            }
            batches += 1;
            examples += batch.batch_size;
        }

        let denom = tokens.max(1.0);
        let report = EvalReport {
            step,
            loss: loss_sum / denom,
            ce: ce_sum / denom,
            kl: kl_sum / denom,
            wer: (t.eval_generate && words > 0).then(|| errors as f64 / words as f64 * 100.0),
            batches,
            examples,
        };

        let mut values = vec![
            ("eval/loss", report.loss),
            ("eval/ce", report.ce),
            ("eval/kl", report.kl),
            ("eval/examples", report.examples as f64),
        ];
        if let Some(wer) = report.wer {
            values.push(("eval/wer", wer));
        }
        self.metrics.record(step, &values)?;
        info!(step, loss = report.loss, wer = ?report.wer, examples, "Evaluation complete");
        self.phase = TrainPhase::Idle;
        Ok(Some(report))
    }

    // ── Checkpointing ─────────────────────────────────────────────────────────

    fn save_checkpoint(&mut self) -> DistillResult<()> {
        self.phase = TrainPhase::Checkpoint;
        self.state.last_checkpoint_step = Some(self.state.step);
        if !self.sync.is_primary() {
            return Ok(());
        }
        let manifest = CheckpointManifest {
            step: self.state.step,
            epoch: self.state.epoch,
            learning_rate: self.state.learning_rate,
            examples_consumed: self.state.rank_draws.iter().sum(),
            rank_draws: self.state.rank_draws.clone(),
            config_fingerprint: self.fingerprint.clone(),
            world_size: self.sync.world_size(),
            last_loss: self.state.last_loss.map(|l| l.total),
            created_at: Utc::now(),
        };
        let path = self.store.save(&manifest, self.student.as_ref(), &self.optimizer)?;
        self.metrics.record(self.state.step, &[("checkpoint/step", self.state.step as f64)])?;
        debug!(path = %path.display(), "Checkpoint written");
        Ok(())
    }

    fn resume(&mut self, target: &str) -> DistillResult<()> {
        let dir = self.store.resolve(target)?;
        let manifest = checkpoint::restore(&dir, self.student.as_mut(), &mut self.optimizer)?;

        if manifest.config_fingerprint != self.fingerprint {
            warn!(
                checkpoint = %manifest.config_fingerprint,
                current = %self.fingerprint,
                "Configuration changed since the checkpoint was written"
            );
        }
        let world = self.sync.world_size();
        self.state.rank_draws = if manifest.rank_draws.len() == world {
            manifest.rank_draws.clone()
        } else {
            warn!(
                checkpoint_world_size = manifest.world_size,
                world_size = world,
                "World size changed; data order after resume will differ"
            );
            vec![manifest.examples_consumed / world as u64; world]
        };
        self.state.step = manifest.step;
        self.state.epoch = manifest.epoch;
        self.state.learning_rate = manifest.learning_rate;
        self.state.last_checkpoint_step = Some(manifest.step);
        info!(step = manifest.step, path = %dir.display(), "Resuming from checkpoint");
        Ok(())
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    fn log_train(&mut self, report: &StepReport, stream: &dyn BatchStream) -> DistillResult<()> {
        if !self.sync.is_primary() {
            return Ok(());
        }
        let stats = stream.stats();
        let values = [
            ("train/loss", report.breakdown.total as f64),
            ("train/ce", report.breakdown.ce as f64),
            ("train/kl", report.breakdown.kl as f64),
            ("train/lr", report.lr),
            ("train/grad_norm", report.grad_norm),
            ("train/epoch", self.state.epoch as f64),
            ("train/workers_ok", report.workers_ok as f64),
            ("train/skipped_batches", self.state.skipped_batches as f64),
            ("data/skip_rate", stats.skip_rate()),
            ("data/skip_rate_exceeded", f64::from(u8::from(stream.skip_rate_exceeded()))),
            ("data/filter_keep_rate", stats.filter.keep_rate()),
        ];
        self.metrics.record(self.state.step, &values)
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.show_progress || !self.sync.is_primary() {
            return ProgressBar::hidden();
        }
        let pb = if total > 0 { ProgressBar::new(total) } else { ProgressBar::new_spinner() };
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )
        .map(|s| s.progress_chars("█▓░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_message("Student training");
        pb
    }
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
