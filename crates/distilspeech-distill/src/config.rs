//! Run configuration.
//!
//! [`DistillConfig`] is plain serde data so the CLI can layer it from
//! defaults, TOML files and environment variables. [`DistillConfig::validate`]
//! must pass before a run starts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::descriptor::DatasetSpec;
use crate::error::{DistillError, DistillResult};
use crate::loss::LossConfig;
use crate::mixer::ExhaustionPolicy;
use crate::optim::AdamWParams;
use crate::preprocess::PreprocessConfig;
use crate::schedule::{LrSchedule, LrSchedulerType};
use crate::source::SourceColumns;
use crate::wer::FilterConfig;

// ── Data ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// `+`-joined training dataset roots.
    pub train_dataset_name: String,
    pub train_dataset_config_name: Option<String>,
    pub train_split_name: Option<String>,
    pub text_column_name: Option<String>,
    /// `+`-joined sampling weights or sample counts.
    pub train_dataset_samples: Option<String>,

    pub eval_dataset_name: Option<String>,
    pub eval_dataset_config_name: Option<String>,
    pub eval_split_name: Option<String>,
    pub eval_text_column_name: Option<String>,

    pub pseudo_label_column: String,
    pub pseudo_label_ids_column: String,
    pub prev_text_column: String,

    /// Read sources lazily instead of loading them into memory.
    pub streaming: bool,
    pub shuffle_buffer_size: usize,
    pub exhaustion_policy: ExhaustionPolicy,
    /// Batches prepared ahead on a background thread; 0 disables prefetching.
    pub prefetch_batches: usize,
    /// Discard the short final batch of an epoch instead of training on it.
    pub drop_last_partial: bool,
    /// Fraction of skipped draws (malformed or filtered) above which a
    /// warning metric is raised.
    pub max_skip_rate: f64,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        let columns = SourceColumns::default();
        Self {
            train_dataset_name: String::new(),
            train_dataset_config_name: None,
            train_split_name: None,
            text_column_name: None,
            train_dataset_samples: None,
            eval_dataset_name: None,
            eval_dataset_config_name: None,
            eval_split_name: None,
            eval_text_column_name: None,
            pseudo_label_column: columns.pseudo_label_column,
            pseudo_label_ids_column: columns.pseudo_label_ids_column,
            prev_text_column: columns.prev_text_column,
            streaming: false,
            shuffle_buffer_size: 500,
            exhaustion_policy: ExhaustionPolicy::default(),
            prefetch_batches: 4,
            drop_last_partial: false,
            max_skip_rate: 0.5,
            seed: 42,
        }
    }
}

impl DataConfig {
    pub fn train_spec(&self) -> DatasetSpec {
        DatasetSpec {
            names: self.train_dataset_name.clone(),
            config_names: self.train_dataset_config_name.clone(),
            splits: self.train_split_name.clone(),
            text_columns: self.text_column_name.clone(),
            samples: self.train_dataset_samples.clone(),
        }
    }

    pub fn eval_spec(&self) -> Option<DatasetSpec> {
        self.eval_dataset_name.as_ref().map(|names| DatasetSpec {
            names: names.clone(),
            config_names: self.eval_dataset_config_name.clone(),
            splits: self.eval_split_name.clone(),
            text_columns: self.eval_text_column_name.clone(),
            samples: None,
        })
    }

    pub fn columns(&self) -> SourceColumns {
        SourceColumns {
            text_column: "text".to_string(),
            pseudo_label_column: self.pseudo_label_column.clone(),
            pseudo_label_ids_column: self.pseudo_label_ids_column.clone(),
            prev_text_column: self.prev_text_column.clone(),
        }
    }
}

// ── Training ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub per_device_batch_size: usize,
    /// Stop after this many optimizer steps; 0 means "until the epochs run out".
    pub max_steps: u64,
    pub num_train_epochs: Option<u64>,
    pub learning_rate: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub warmup_steps: u64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    /// Global gradient-norm clip; 0 disables clipping.
    pub max_grad_norm: f64,
    /// Keep the student encoder fixed and feed it the teacher's encoder output.
    pub freeze_encoder: bool,
    pub gradient_checkpointing: bool,
    /// BF16 weights on CUDA, F32 elsewhere.
    pub mixed_precision: bool,
    pub logging_steps: u64,
    /// Evaluate every N steps; 0 disables periodic evaluation.
    pub eval_steps: u64,
    pub max_eval_batches: Option<usize>,
    /// Greedy-decode eval examples and report WER.
    pub eval_generate: bool,
    pub generation_max_new_tokens: usize,
    /// Seconds a worker waits for the others at gradient sync.
    pub ddp_timeout: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            per_device_batch_size: 8,
            max_steps: 0,
            num_train_epochs: None,
            learning_rate: 1e-4,
            lr_scheduler_type: LrSchedulerType::default(),
            warmup_steps: 500,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            freeze_encoder: false,
            gradient_checkpointing: false,
            mixed_precision: true,
            logging_steps: 25,
            eval_steps: 0,
            max_eval_batches: None,
            eval_generate: false,
            generation_max_new_tokens: 128,
            ddp_timeout: 1800,
        }
    }
}

impl TrainingConfig {
    pub fn schedule(&self) -> LrSchedule {
        LrSchedule::new(self.lr_scheduler_type, self.learning_rate, self.warmup_steps, self.max_steps)
    }

    pub fn adam_params(&self) -> AdamWParams {
        AdamWParams {
            beta1: self.adam_beta1,
            beta2: self.adam_beta2,
            eps: self.adam_epsilon,
            weight_decay: self.weight_decay,
        }
    }
}

// ── Checkpointing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub output_dir: PathBuf,
    /// Checkpoint every N steps; 0 keeps only the final checkpoint.
    pub save_steps: u64,
    /// Keep at most this many checkpoints, evicting the oldest.
    pub save_total_limit: Option<usize>,
    /// `latest` or a checkpoint directory.
    pub resume_from_checkpoint: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./distil-output"),
            save_steps: 1000,
            save_total_limit: None,
            resume_from_checkpoint: None,
        }
    }
}

// ── DistillConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    pub data: DataConfig,
    pub preprocess: PreprocessConfig,
    pub filter: FilterConfig,
    pub loss: LossConfig,
    pub training: TrainingConfig,
    pub checkpoint: CheckpointConfig,
}

impl DistillConfig {
    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> DistillResult<()> {
        let t = &self.training;
        let unit = |field: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(DistillError::invalid(field, format!("must be in [0, 1], got {v}")))
            }
        };

        if self.data.train_dataset_name.trim().is_empty() {
            return Err(DistillError::invalid("data.train_dataset_name", "no training dataset configured"));
        }
        unit("preprocess.timestamp_probability", self.preprocess.timestamp_probability)?;
        unit("preprocess.condition_on_prev_probability", self.preprocess.condition_on_prev_probability)?;
        unit("loss.alpha", self.loss.alpha)?;
        unit("data.max_skip_rate", self.data.max_skip_rate)?;

        if !(self.loss.temperature > 0.0) {
            return Err(DistillError::invalid("loss.temperature", "must be positive"));
        }
        if !(self.filter.wer_threshold >= 0.0) {
            return Err(DistillError::invalid("filter.wer_threshold", "must be non-negative"));
        }
        if self.preprocess.max_label_length < 4 {
            return Err(DistillError::invalid("preprocess.max_label_length", "must be at least 4"));
        }
        if t.per_device_batch_size == 0 {
            return Err(DistillError::invalid("training.per_device_batch_size", "must be positive"));
        }
        if !(t.learning_rate > 0.0) {
            return Err(DistillError::invalid("training.learning_rate", "must be positive"));
        }
        if t.max_steps == 0 {
            match t.num_train_epochs {
                None | Some(0) => {
                    return Err(DistillError::invalid(
                        "training.max_steps",
                        "set max_steps or num_train_epochs",
                    ))
                }
                Some(_) if self.data.exhaustion_policy == ExhaustionPolicy::Recycle => {
                    return Err(DistillError::invalid(
                        "training.num_train_epochs",
                        "epochs never end with exhaustion_policy = recycle; set max_steps",
                    ))
                }
                Some(_) => {}
            }
            if t.lr_scheduler_type == LrSchedulerType::Linear {
                return Err(DistillError::invalid(
                    "training.lr_scheduler_type",
                    "the linear schedule needs max_steps",
                ));
            }
        }
        if t.ddp_timeout == 0 {
            return Err(DistillError::invalid("training.ddp_timeout", "must be positive"));
        }
        if t.eval_steps > 0 && self.data.eval_dataset_name.is_none() {
            return Err(DistillError::invalid("training.eval_steps", "no eval dataset configured"));
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON form, ignoring where a run resumes from.
    pub fn fingerprint(&self) -> String {
        let mut canonical = self.clone();
        canonical.checkpoint.resume_from_checkpoint = None;
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&json))
    }
}
