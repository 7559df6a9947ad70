//! Checkpoint persistence.
//!
//! Layout under the output directory:
//!
//! ```text
//! checkpoint-{step}/
//!   model.safetensors       student weights
//!   optimizer.safetensors   AdamW moments and update counter
//!   trainer_state.json      CheckpointManifest
//! ```
//!
//! A checkpoint is written into a hidden temporary directory and renamed
//! into place, so a directory named `checkpoint-*` is always complete.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use distilspeech_core::Seq2SeqModel;

use crate::error::{DistillError, DistillResult};
use crate::optim::AdamW;

pub const MODEL_FILE: &str = "model.safetensors";
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const STATE_FILE: &str = "trainer_state.json";
const PREFIX: &str = "checkpoint-";

/// Everything besides tensors needed to continue a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub step: u64,
    pub epoch: u64,
    pub learning_rate: f64,
    /// Pipeline draws consumed by the steps taken so far, over all workers.
    pub examples_consumed: u64,
    /// The same count per worker, indexed by rank.
    #[serde(default)]
    pub rank_draws: Vec<u64>,
    pub config_fingerprint: String,
    pub world_size: usize,
    pub last_loss: Option<f32>,
    pub created_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    root: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, save_total_limit: Option<usize>) -> Self {
        Self { root: root.into(), save_total_limit }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, step: u64) -> PathBuf {
        self.root.join(format!("{PREFIX}{step}"))
    }

    /// Persist `model`, `optimizer` and `manifest`, then apply retention.
    pub fn save(
        &self,
        manifest: &CheckpointManifest,
        model: &dyn Seq2SeqModel,
        optimizer: &AdamW,
    ) -> DistillResult<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let final_dir = self.path_for(manifest.step);
        let tmp_dir = self.root.join(format!(".{PREFIX}{}.tmp", manifest.step));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        model
            .save_weights(&tmp_dir.join(MODEL_FILE))
            .map_err(|e| DistillError::Checkpoint(format!("writing model weights: {e}")))?;
        optimizer.save(&tmp_dir.join(OPTIMIZER_FILE))?;
        fs::write(tmp_dir.join(STATE_FILE), serde_json::to_string_pretty(manifest)?)?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        info!(step = manifest.step, path = %final_dir.display(), "Checkpoint saved");

        self.apply_retention()?;
        Ok(final_dir)
    }

    /// Complete checkpoints, oldest first.
    pub fn list(&self) -> DistillResult<Vec<(u64, PathBuf)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(PREFIX))
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(step) = step {
                if path.join(STATE_FILE).is_file() {
                    found.push((step, path));
                }
            }
        }
        found.sort_by_key(|(step, _)| *step);
        Ok(found)
    }

    pub fn latest(&self) -> DistillResult<Option<PathBuf>> {
        Ok(self.list()?.pop().map(|(_, p)| p))
    }

    /// Resolve a `resume_from_checkpoint` value: `latest` or a directory.
    pub fn resolve(&self, target: &str) -> DistillResult<PathBuf> {
        if target == "latest" {
            return self
                .latest()?
                .ok_or_else(|| DistillError::Checkpoint(format!("no checkpoint found in {}", self.root.display())));
        }
        let path = PathBuf::from(target);
        if !path.join(STATE_FILE).is_file() {
            return Err(DistillError::Checkpoint(format!("{} is not a checkpoint directory", path.display())));
        }
        Ok(path)
    }

    /// Remove the oldest checkpoints beyond `save_total_limit`. The newest
    /// checkpoint is never removed.
    fn apply_retention(&self) -> DistillResult<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };
        let all = self.list()?;
        let excess = all.len().saturating_sub(limit.max(1));
        for (step, path) in all.into_iter().take(excess) {
            match fs::remove_dir_all(&path) {
                Ok(()) => info!(step, path = %path.display(), "Checkpoint evicted"),
                Err(e) => warn!(step, error = %e, "Failed to evict checkpoint"),
            }
        }
        Ok(())
    }
}

pub fn load_manifest(dir: &Path) -> DistillResult<CheckpointManifest> {
    let text = fs::read_to_string(dir.join(STATE_FILE))
        .map_err(|e| DistillError::Checkpoint(format!("reading {}: {e}", dir.join(STATE_FILE).display())))?;
    Ok(serde_json::from_str(&text)?)
}

/// Load weights and optimizer state from `dir` into the live objects.
pub fn restore(
    dir: &Path,
    model: &mut dyn Seq2SeqModel,
    optimizer: &mut AdamW,
) -> DistillResult<CheckpointManifest> {
    let manifest = load_manifest(dir)?;
    model
        .load_weights(&dir.join(MODEL_FILE))
        .map_err(|e| DistillError::Checkpoint(format!("loading model weights: {e}")))?;
    optimizer.load(&dir.join(OPTIMIZER_FILE))?;
    info!(step = manifest.step, epoch = manifest.epoch, path = %dir.display(), "Checkpoint restored");
    Ok(manifest)
}
