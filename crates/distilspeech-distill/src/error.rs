use thiserror::Error;

use distilspeech_core::CoreError;

#[derive(Debug, Error)]
pub enum DistillError {
    #[error("Dataset configuration mismatch: `{field}` has {got} entries, expected {expected}")]
    ConfigMismatch { field: String, expected: usize, got: usize },

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("All dataset sources exhausted after {drawn} examples")]
    SourceExhausted { drawn: u64 },

    #[error("No reference text for example from '{source_id}'; WER cannot be computed")]
    FilterUncomparable { source_id: String },

    #[error("Loss diverged at step {step}: {value}")]
    LossDivergence { step: u64, value: f32 },

    #[error(
        "Gradient synchronisation timed out after {timeout_secs}s on rank {rank} \
         ({arrived}/{world_size} workers arrived)"
    )]
    SyncTimeout { rank: usize, world_size: usize, arrived: usize, timeout_secs: u64 },

    #[error("Gradient synchronisation failed: {0}")]
    SyncFailed(String),

    #[error("Malformed example from '{source_id}': {reason}")]
    MalformedExample { source_id: String, reason: String },

    #[error("Batch failed at step {step}: {reason}")]
    BatchFailed { step: u64, reason: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Data pipeline worker stopped: {0}")]
    PipelineClosed(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DistillError {
    /// Whether the condition must abort the run.
    ///
    /// Non-fatal errors are handled locally: malformed examples and failed
    /// batches are skipped, missing references pass through the filter and
    /// exhausted sources end the epoch.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SourceExhausted { .. }
                | Self::FilterUncomparable { .. }
                | Self::MalformedExample { .. }
                | Self::BatchFailed { .. }
        )
    }

    pub(crate) fn malformed(source_id: &str, reason: impl Into<String>) -> Self {
        Self::MalformedExample { source_id: source_id.to_string(), reason: reason.into() }
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig { field: field.to_string(), reason: reason.into() }
    }
}

pub type DistillResult<T> = Result<T, DistillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(DistillError::LossDivergence { step: 3, value: f32::NAN }.is_fatal());
        assert!(DistillError::SyncTimeout { rank: 0, world_size: 2, arrived: 1, timeout_secs: 5 }.is_fatal());
        assert!(DistillError::ConfigMismatch { field: "x".into(), expected: 2, got: 1 }.is_fatal());
        assert!(!DistillError::SourceExhausted { drawn: 10 }.is_fatal());
        assert!(!DistillError::malformed("ls", "no features").is_fatal());
        assert!(!DistillError::BatchFailed { step: 1, reason: "shape".into() }.is_fatal());
        assert!(!DistillError::FilterUncomparable { source_id: "ls".into() }.is_fatal());
    }

    #[test]
    fn messages_are_descriptive() {
        let e = DistillError::ConfigMismatch { field: "train_split_name".into(), expected: 2, got: 3 };
        assert_eq!(
            e.to_string(),
            "Dataset configuration mismatch: `train_split_name` has 3 entries, expected 2"
        );
    }
}
