//! # distilspeech-distill
//!
//! Knowledge distillation for encoder-decoder speech models.
//!
//! A frozen *teacher* and a trainable *student* (both [`Seq2SeqModel`]s) see
//! the same batches. The student is trained on
//!
//! ```text
//! loss = α · CE(student, targets) + (1 - α) · T² · KL(teacher_T ‖ student_T)
//! ```
//!
//! where the targets are ground-truth text or teacher pseudo-labels.
//!
//! ## Data flow
//!
//! ```text
//! DatasetSpec ─resolve→ descriptors ─open→ ExampleSource × N
//!     → WeightedMixer → Preprocessor → WerFilter → Collator ─→ Batch
//!     → Prefetcher (thread, bounded channel)
//!     → Trainer: LossEngine → backward → all-reduce → clip → AdamW
//!     → CheckpointStore / MetricsSink
//! ```
//!
//! ## Usage
//!
//! ```text
//! distilspeech init-student --teacher ./whisper-large-v3 --out ./student --decoder-layers 2
//! distilspeech train --config distil.toml --teacher ./whisper-large-v3 --student ./student
//! ```
//!
//! [`Seq2SeqModel`]: distilspeech_core::Seq2SeqModel

pub mod checkpoint;
pub mod collate;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod export;
pub mod loss;
pub mod metrics;
pub mod mixer;
pub mod optim;
pub mod pipeline;
pub mod preprocess;
pub mod schedule;
pub mod source;
pub mod student;
pub mod sync;
pub mod trainer;
pub mod wer;

#[cfg(test)]
mod test_util;

pub use checkpoint::{CheckpointManifest, CheckpointStore};
pub use config::{CheckpointConfig, DataConfig, DistillConfig, TrainingConfig};
pub use error::{DistillError, DistillResult};
pub use export::export;
pub use metrics::{FanOut, JsonlSink, MetricsSink, TracingSink};
pub use pipeline::{build_eval_pipeline, build_train_pipeline, DataPipeline, PipelineContext, PipelineStats};
pub use student::{init_student_from_teacher, StudentInit};
pub use sync::{AbortHandle, CollectiveGroup, GradientSync, GroupMember, LocalSync};
pub use trainer::{Trainer, TrainerParts, TrainingSummary};
pub use wer::{word_error_rate, WerFilter};
