use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use distilspeech_distill::DistillConfig;

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub models: ModelsConfig,
    pub device: DeviceConfig,
    pub distill: DistillConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// HuggingFace-format Whisper directory of the frozen teacher.
    pub teacher: Option<String>,
    /// Directory the student is initialised from (see `init-student`).
    pub student: Option<String>,
    /// Directory holding `tokenizer.json`; defaults to the teacher's.
    pub tokenizer: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    /// First CUDA device; worker `r` uses `cuda_device_id + r`.
    pub cuda_device_id: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { prefer_gpu: true, cuda_device_id: 0 }
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `DISTILSPEECH__`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .add_source(Config::try_from(&AppConfig::default())?)
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (DISTILSPEECH__DISTILL__TRAINING__MAX_STEPS, etc.)
    builder = builder.add_source(
        Environment::with_prefix("DISTILSPEECH")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// Expand a leading `~` to the home directory.
pub fn expand_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── load_config defaults ──────────────────────────────────────────────────

    #[test]
    fn test_defaults_match_distill_defaults() {
        let cfg = load_config(None).unwrap();
        let defaults = DistillConfig::default();
        assert_eq!(cfg.distill.training.per_device_batch_size, defaults.training.per_device_batch_size);
        assert_eq!(cfg.distill.training.warmup_steps, defaults.training.warmup_steps);
        assert_eq!(cfg.distill.checkpoint.save_steps, defaults.checkpoint.save_steps);
        assert!((cfg.distill.loss.alpha - defaults.loss.alpha).abs() < f64::EPSILON);
        assert!(cfg.distill.checkpoint.resume_from_checkpoint.is_none());
    }

    #[test]
    fn test_default_device() {
        let cfg = load_config(None).unwrap();
        assert!(cfg.device.prefer_gpu);
        assert_eq!(cfg.device.cuda_device_id, 0);
        assert!(cfg.models.teacher.is_none());
    }

    // ── load_config from a custom file ────────────────────────────────────────

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("distil.toml");
        std::fs::write(
            &file,
            "[models]\nteacher = \"/models/whisper-large\"\n\
             [distill.data]\ntrain_dataset_name = \"data/a+data/b\"\n\
             [distill.training]\nmax_steps = 5000\nlearning_rate = 0.0003\n\
             [distill.filter]\nmissing_reference = \"reject\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.models.teacher.as_deref(), Some("/models/whisper-large"));
        assert_eq!(cfg.distill.data.train_dataset_name, "data/a+data/b");
        assert_eq!(cfg.distill.training.max_steps, 5000);
        assert!((cfg.distill.training.learning_rate - 3e-4).abs() < 1e-12);
        assert_eq!(
            cfg.distill.filter.missing_reference,
            distilspeech_distill::wer::MissingReferencePolicy::Reject
        );
        // untouched keys keep their defaults
        assert_eq!(cfg.distill.training.logging_steps, 25);
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    // ── expand_path ───────────────────────────────────────────────────────────

    #[test]
    fn test_expand_absolute_path_unchanged() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_produces_non_tilde_prefix() {
        let path = expand_path("~/.cache/distilspeech");
        let s = path.to_string_lossy();
        assert!(!s.starts_with('~'), "Expanded path must not start with '~', got: {s}");
        assert!(s.ends_with(".cache/distilspeech"));
    }

    #[test]
    fn test_expand_relative_path_unchanged() {
        assert_eq!(expand_path("relative/path"), PathBuf::from("relative/path"));
    }
}
