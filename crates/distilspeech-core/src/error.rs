use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model config error: {field} — {reason}")]
    Config { field: String, reason: String },

    #[error("Missing model file: {0}")]
    MissingFile(String),

    #[error("Unknown special token: {0}")]
    UnknownToken(String),

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),

    #[error("Model is frozen: {0}")]
    Frozen(String),

    #[error("Parameter map lock poisoned")]
    Poisoned,
}

pub type CoreResult<T> = Result<T, CoreError>;
