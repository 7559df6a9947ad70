//! `distilspeech train`: distil a frozen teacher into a student.
//!
//! ```text
//! distilspeech train \
//!   --config      distil.toml \
//!   --teacher     ./whisper-large-v3 \
//!   --student     ./student-2l \
//!   --output-dir  ./distil-output \
//!   --world-size  2
//! ```
//!
//! With `--world-size N` one worker thread is started per device
//! (`cuda_device_id .. cuda_device_id + N`); the workers average gradients
//! through an in-process all-reduce group. Ctrl-C lets the current step
//! finish, writes a checkpoint and exits; a second Ctrl-C exits at once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};

use distilspeech_core::{
    device_name, select_device, training_dtype, BasicTextNormalizer, SpecialTokens, TextTokenizer,
    WhisperModel, WhisperTokenizer,
};
use distilspeech_distill::{
    build_eval_pipeline, build_train_pipeline, export, CollectiveGroup, FanOut, GradientSync, JsonlSink,
    LocalSync, MetricsSink, PipelineContext, Trainer, TrainerParts, TrainingSummary, TracingSink,
};

use crate::config::{expand_path, AppConfig};

/// Command-line values that take precedence over the configuration.
#[derive(Debug, Default)]
pub struct TrainOverrides {
    pub teacher: Option<String>,
    pub student: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub max_steps: Option<u64>,
    pub resume: Option<String>,
    pub world_size: usize,
    pub cpu: bool,
    pub show_progress: bool,
}

/// Everything the worker threads share.
struct WorkerSetup {
    config: AppConfig,
    teacher_dir: PathBuf,
    student_dir: PathBuf,
    tokenizer_dir: PathBuf,
    context: PipelineContext,
    shutdown: Arc<AtomicBool>,
    show_progress: bool,
}

// ── Main entry point ──────────────────────────────────────────────────────────

pub fn run(mut config: AppConfig, overrides: TrainOverrides) -> Result<()> {
    apply_overrides(&mut config, &overrides);
    let world_size = overrides.world_size;
    if world_size == 0 {
        bail!("--world-size must be at least 1");
    }

    let teacher_dir = config
        .models
        .teacher
        .as_deref()
        .map(expand_path)
        .context("No teacher model: pass --teacher or set models.teacher")?;
    let student_dir = config
        .models
        .student
        .as_deref()
        .map(expand_path)
        .context("No student model: pass --student (see `distilspeech init-student`) or set models.student")?;
    let tokenizer_dir = config.models.tokenizer.as_deref().map(expand_path).unwrap_or_else(|| teacher_dir.clone());

    config.distill.validate().context("Invalid distillation configuration")?;

    // ── Tokenizer ─────────────────────────────────────────────────────────────
    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(
        WhisperTokenizer::from_model_dir(&tokenizer_dir)
            .with_context(|| format!("Failed to load tokenizer from {}", tokenizer_dir.display()))?,
    );
    let special = SpecialTokens::resolve(tokenizer.as_ref(), config.distill.preprocess.language.as_deref())
        .context("Tokenizer is missing Whisper control tokens")?;
    let context = PipelineContext { tokenizer, special, normalizer: Arc::new(BasicTextNormalizer) };

    // ── Ctrl-C ────────────────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                warn!("Second interrupt, exiting immediately");
                std::process::exit(130);
            }
            warn!("Interrupt received, finishing the current step and saving a checkpoint");
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let setup = WorkerSetup {
        config,
        teacher_dir,
        student_dir,
        tokenizer_dir,
        context,
        shutdown,
        show_progress: overrides.show_progress,
    };

    info!(
        world_size,
        teacher = %setup.teacher_dir.display(),
        student = %setup.student_dir.display(),
        output_dir = %setup.config.distill.checkpoint.output_dir.display(),
        "Starting distillation"
    );

    let summary = if world_size == 1 {
        run_worker(&setup, Box::new(LocalSync))?
    } else {
        run_group(&setup, world_size)?
    };

    print_summary(&setup, &summary);
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, overrides: &TrainOverrides) {
    if let Some(t) = &overrides.teacher {
        config.models.teacher = Some(t.clone());
    }
    if let Some(s) = &overrides.student {
        config.models.student = Some(s.clone());
    }
    if let Some(dir) = &overrides.output_dir {
        config.distill.checkpoint.output_dir = dir.clone();
    }
    if let Some(steps) = overrides.max_steps {
        config.distill.training.max_steps = steps;
    }
    if let Some(resume) = &overrides.resume {
        config.distill.checkpoint.resume_from_checkpoint = Some(resume.clone());
    }
    if overrides.cpu {
        config.device.prefer_gpu = false;
    }
}

// ── Workers ───────────────────────────────────────────────────────────────────

/// Run one worker per rank and return the primary worker's summary.
fn run_group(setup: &WorkerSetup, world_size: usize) -> Result<TrainingSummary> {
    let timeout = Duration::from_secs(setup.config.distill.training.ddp_timeout);
    let members = CollectiveGroup::new(world_size, timeout);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                let abort = member.abort_handle();
                let rank = member.rank();
                let handle = thread::Builder::new()
                    .name(format!("distill-worker-{rank}"))
                    .spawn_scoped(scope, move || {
                        let result = run_worker(setup, Box::new(member));
                        if result.is_err() {
                            abort.abort();
                        }
                        result
                    });
                (rank, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(rank, handle)| match handle {
                Ok(h) => (rank, h.join().map_err(|_| anyhow!("worker {rank} panicked")).and_then(|r| r)),
                Err(e) => (rank, Err(anyhow!("failed to spawn worker {rank}: {e}"))),
            })
            .collect()
    });

    let mut primary = None;
    let mut first_error = None;
    for (rank, result) in results {
        match result {
            Ok(summary) if rank == 0 => primary = Some(summary),
            Ok(_) => {}
            Err(e) => {
                warn!(rank, error = %e, "Worker failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    primary.context("primary worker produced no summary")
}

fn run_worker(setup: &WorkerSetup, sync: Box<dyn GradientSync>) -> Result<TrainingSummary> {
    let config = &setup.config;
    let rank = sync.rank();
    let primary = sync.is_primary();
    let output_dir = config.distill.checkpoint.output_dir.clone();

    let device = select_device(config.device.prefer_gpu, config.device.cuda_device_id + rank)
        .with_context(|| format!("No device for worker {rank}"))?;
    let dtype = training_dtype(&device, config.distill.training.mixed_precision);
    info!(rank, device = device_name(&device), ?dtype, "Worker starting");

    let teacher = WhisperModel::load(&setup.teacher_dir, &device, dtype, false)
        .with_context(|| format!("Failed to load teacher from {}", setup.teacher_dir.display()))?;
    let student = WhisperModel::load(&setup.student_dir, &device, dtype, true)
        .with_context(|| format!("Failed to load student from {}", setup.student_dir.display()))?;

    let train = build_train_pipeline(&config.distill, &setup.context, rank)
        .context("Failed to build the training pipeline")?;
    let eval = if primary {
        build_eval_pipeline(&config.distill, &setup.context).context("Failed to build the evaluation pipeline")?
    } else {
        None
    };

    let metrics: Box<dyn MetricsSink> = if primary {
        let jsonl = JsonlSink::open(&output_dir)
            .with_context(|| format!("Cannot open metrics file in {}", output_dir.display()))?;
        Box::new(FanOut::new(vec![Box::new(TracingSink), Box::new(jsonl)]))
    } else {
        Box::new(FanOut::default())
    };

    let mut trainer = Trainer::new(TrainerParts {
        config: config.distill.clone(),
        teacher: Box::new(teacher),
        student: Box::new(student),
        train,
        eval,
        context: setup.context.clone(),
        sync,
        metrics,
        shutdown: Arc::clone(&setup.shutdown),
    })?
    .with_progress(setup.show_progress);

    let summary = trainer.run().with_context(|| format!("Training failed on worker {rank}"))?;

    if primary {
        info!(output = %output_dir.display(), "Exporting student");
        export(trainer.student(), &setup.student_dir, &setup.tokenizer_dir, &output_dir)
            .context("Failed to export the student")?;
    }
    Ok(summary)
}

// ── Report ────────────────────────────────────────────────────────────────────

fn print_summary(setup: &WorkerSetup, summary: &TrainingSummary) {
    let output_dir = &setup.config.distill.checkpoint.output_dir;
    let loss = summary.final_loss.map(|l| format!("{l:.4}")).unwrap_or_else(|| "n/a".to_string());
    let filter = &summary.pipeline.filter;

    println!(
        "\nDistillation {}!\n\
         Output: {}\n\
         Steps: {}  (skipped batches: {})\n\
         Final loss: {}\n\
         Elapsed: {:.1} s\n\
         Pseudo-labels kept: {}/{} ({:.1} %)",
        if summary.stopped_early { "stopped early" } else { "complete" },
        output_dir.display(),
        summary.total_steps,
        summary.skipped_batches,
        loss,
        summary.elapsed_secs,
        filter.kept,
        filter.evaluated,
        filter.keep_rate() * 100.0,
    );
    if let Some(eval) = &summary.last_eval {
        let wer = eval.wer.map(|w| format!("{w:.2} %")).unwrap_or_else(|| "n/a".to_string());
        println!("Eval loss: {:.4}  WER: {}  ({} examples)", eval.loss, wer, eval.examples);
    }
    if let Some(ckpt) = &summary.last_checkpoint {
        println!("Last checkpoint: {}", ckpt.display());
    }
}
