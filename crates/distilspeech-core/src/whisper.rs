//! Whisper adapter for [`Seq2SeqModel`].
//!
//! Wraps `candle_transformers::models::whisper` so the distillation pipeline
//! can drive a HuggingFace-format Whisper checkpoint (`config.json` +
//! `model.safetensors`, single file or sharded).
//!
//! ## Frozen vs trainable
//!
//! * **Frozen** (teacher): weights are memory-mapped through a
//!   `VarBuilder`; no gradients can ever reach them.
//! * **Trainable** (student): the model is built from a [`VarMap`] so every
//!   parameter is a [`Var`]. Pre-trained values are copied in after
//!   construction, cast to the training dtype.

use std::path::{Path, PathBuf};

use candle_core::{safetensors, DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::whisper::{model::Whisper, Config};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::model::Seq2SeqModel;

const ENCODER_PREFIX: &str = "model.encoder.";

pub struct WhisperModel {
    inner: Whisper,
    varmap: Option<VarMap>,
    config: Config,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for WhisperModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperModel")
            .field("dtype", &self.dtype)
            .field("trainable", &self.varmap.is_some())
            .field("encoder_layers", &self.config.encoder_layers)
            .field("decoder_layers", &self.config.decoder_layers)
            .finish()
    }
}

impl WhisperModel {
    /// Load a Whisper checkpoint from `model_dir`.
    pub fn load(model_dir: &Path, device: &Device, dtype: DType, trainable: bool) -> CoreResult<Self> {
        let config = read_config(model_dir)?;
        let weight_paths = collect_safetensor_paths(model_dir)?;

        info!(
            model_dir = %model_dir.display(),
            encoder_layers = config.encoder_layers,
            decoder_layers = config.decoder_layers,
            d_model = config.d_model,
            ?dtype,
            trainable,
            "Loading Whisper model"
        );

        if !trainable {
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_paths, dtype, device)? };
            let inner = Whisper::load(&vb, config.clone())?;
            return Ok(Self { inner, varmap: None, config, dtype, device: device.clone() });
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let inner = Whisper::load(&vb, config.clone())?;

        let mut model = Self { inner, varmap: Some(varmap), config, dtype, device: device.clone() };
        for path in &weight_paths {
            model.load_weights(path)?;
        }
        info!(shards = weight_paths.len(), "Pre-trained weights loaded into trainable Whisper");
        Ok(model)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Seq2SeqModel for WhisperModel {
    fn encode(&mut self, features: &Tensor) -> CoreResult<Tensor> {
        Ok(self.inner.encoder.forward(features, true)?)
    }

    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_hidden: &Tensor) -> CoreResult<Tensor> {
        // flush=true: training batches never share a cross-attention cache.
        let hidden = self.inner.decoder.forward(decoder_input_ids, encoder_hidden, true)?;
        Ok(self.inner.decoder.final_linear(&hidden)?)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        let Some(varmap) = &self.varmap else {
            return Vec::new();
        };
        match varmap.data().lock() {
            Ok(data) => data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn is_encoder_param(&self, name: &str) -> bool {
        name.starts_with(ENCODER_PREFIX)
    }

    fn set_gradient_checkpointing(&mut self, enabled: bool) -> bool {
        if enabled {
            warn!("Whisper backend keeps all activations; gradient checkpointing unavailable");
        }
        false
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn save_weights(&self, path: &Path) -> CoreResult<()> {
        let varmap = self
            .varmap
            .as_ref()
            .ok_or_else(|| CoreError::Frozen("cannot save a memory-mapped model".to_string()))?;
        varmap.save(path)?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> CoreResult<()> {
        let varmap = self
            .varmap
            .as_ref()
            .ok_or_else(|| CoreError::Frozen("cannot overwrite a memory-mapped model".to_string()))?;
        let tensors = safetensors::load(path, &self.device)?;
        let data = varmap.data().lock().map_err(|_| CoreError::Poisoned)?;

        let mut loaded = 0usize;
        for (name, var) in data.iter() {
            match tensors.get(name) {
                Some(t) => {
                    var.set(&t.to_dtype(self.dtype)?)?;
                    loaded += 1;
                }
                None => warn!(name = %name, file = %path.display(), "Parameter missing from weights file"),
            }
        }
        info!(file = %path.display(), loaded, total = data.len(), "Weights loaded");
        Ok(())
    }
}

// ── Checkpoint discovery ──────────────────────────────────────────────────────

/// Parse `config.json` from a HuggingFace Whisper directory.
pub fn read_config(model_dir: &Path) -> CoreResult<Config> {
    let path = model_dir.join("config.json");
    if !path.exists() {
        return Err(CoreError::MissingFile(path.display().to_string()));
    }
    let json = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&json)?)
}

/// List the safetensors shards of a checkpoint directory.
///
/// Prefers `model.safetensors.index.json` (sharded) and falls back to a single
/// `model.safetensors`.
pub fn collect_safetensor_paths(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let json = std::fs::read_to_string(&index_path)?;
        let index: serde_json::Value = serde_json::from_str(&json)?;
        let mut shards: Vec<String> = index["weight_map"]
            .as_object()
            .map(|m| {
                m.values()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect::<std::collections::HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        shards.sort();
        return Ok(shards.iter().map(|s| dir.join(s)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    Err(CoreError::Config {
        field: "model_dir".to_string(),
        reason: format!("No safetensors weights found in {}", dir.display()),
    })
}
