use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use config::load_config;

/// distilspeech: knowledge distillation for Whisper-style speech models
#[derive(Debug, Parser)]
#[command(name = "distilspeech", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a student against a frozen teacher.
    ///
    /// Datasets, loss, optimizer and checkpoint settings come from the
    /// configuration file; the flags below override the most common ones.
    Train {
        /// Teacher model directory (HuggingFace Whisper layout).
        #[arg(long)]
        teacher: Option<String>,

        /// Student model directory, e.g. the output of `init-student`.
        #[arg(long)]
        student: Option<String>,

        /// Directory for checkpoints, metrics and the exported student.
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Stop after this many optimizer steps.
        #[arg(long)]
        max_steps: Option<u64>,

        /// Resume from `latest` or a checkpoint directory.
        #[arg(long, value_name = "CHECKPOINT")]
        resume: Option<String>,

        /// Number of data-parallel workers, one per device.
        #[arg(long, default_value_t = 1)]
        world_size: usize,

        /// Force CPU even when a GPU is available.
        #[arg(long)]
        cpu: bool,

        /// Hide the progress bar.
        #[arg(long)]
        no_progress: bool,
    },

    /// Report how many pseudo-labels the WER filter keeps per training source.
    Filter {
        /// Tokenizer directory, needed when pseudo-labels are stored as ids.
        #[arg(long)]
        tokenizer: Option<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Build a student from a teacher by keeping a subset of decoder layers.
    InitStudent {
        /// Teacher model directory.
        #[arg(long)]
        teacher: String,

        /// Output directory for the student.
        #[arg(long)]
        out: PathBuf,

        /// Number of decoder layers the student keeps.
        #[arg(long, default_value_t = 2)]
        decoder_layers: usize,
    },

    /// List the checkpoints in an output directory.
    Checkpoints {
        /// Output directory (defaults to `distill.checkpoint.output_dir`).
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    init_tracing(&cli.log_format);

    // Load configuration
    let cfg = load_config(cli.config.as_ref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Train { teacher, student, output_dir, max_steps, resume, world_size, cpu, no_progress } => {
            let overrides = commands::train::TrainOverrides {
                teacher,
                student,
                output_dir,
                max_steps,
                resume,
                world_size,
                cpu,
                show_progress: !no_progress,
            };
            commands::train::run(cfg, overrides)?;
        }
        Commands::Filter { tokenizer, json } => {
            commands::filter::run(&cfg, tokenizer.as_deref(), json)?;
        }
        Commands::InitStudent { teacher, out, decoder_layers } => {
            commands::init_student::run(&teacher, &out, decoder_layers)?;
        }
        Commands::Checkpoints { output_dir } => {
            commands::checkpoints::run(&cfg, output_dir.as_ref())?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry
            .with(fmt::layer().json())
            .init();
    } else {
        registry
            .with(fmt::layer().pretty())
            .init();
    }
}
