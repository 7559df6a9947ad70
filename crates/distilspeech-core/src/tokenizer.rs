use std::path::Path;

use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Text ↔ token-id conversion used by the preprocessor and evaluation.
pub trait TextTokenizer: Send + Sync {
    /// Encode text without adding any special tokens.
    fn encode(&self, text: &str) -> CoreResult<Vec<u32>>;

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> CoreResult<String>;

    /// Id of an exact token string (e.g. `"<|endoftext|>"`).
    fn token_id(&self, token: &str) -> Option<u32>;

    fn vocab_size(&self) -> usize;
}

/// Thin wrapper around a HuggingFace `tokenizer.json` for Whisper.
#[derive(Debug)]
pub struct WhisperTokenizer {
    inner: HfTokenizer,
}

impl WhisperTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        debug!(
            path = %path.display(),
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded from file"
        );
        Ok(Self { inner })
    }

    /// Load `tokenizer.json` from a model directory.
    pub fn from_model_dir(dir: &Path) -> CoreResult<Self> {
        let path = dir.join("tokenizer.json");
        if !path.exists() {
            return Err(CoreError::MissingFile(path.display().to_string()));
        }
        Self::from_file(&path)
    }
}

impl TextTokenizer for WhisperTokenizer {
    fn encode(&self, text: &str) -> CoreResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> CoreResult<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

// ── Whisper special tokens ────────────────────────────────────────────────────

pub const START_OF_TRANSCRIPT: &str = "<|startoftranscript|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";
pub const START_OF_PREV: &str = "<|startofprev|>";
pub const NO_TIMESTAMPS: &str = "<|notimestamps|>";
pub const TRANSCRIBE: &str = "<|transcribe|>";
pub const TRANSLATE: &str = "<|translate|>";
pub const FIRST_TIMESTAMP: &str = "<|0.00|>";

/// Ids of the Whisper control tokens the pipeline needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub start_of_transcript: u32,
    pub end_of_text: u32,
    pub start_of_prev: u32,
    pub no_timestamps: u32,
    pub transcribe: u32,
    pub translate: Option<u32>,
    /// Language token, e.g. `<|en|>`. `None` for English-only checkpoints.
    pub language: Option<u32>,
    /// First timestamp token; every id at or above it is a timestamp.
    pub timestamp_begin: u32,
}

impl SpecialTokens {
    /// Resolve the control tokens from the tokenizer vocabulary.
    ///
    /// `language` is an ISO code such as `"en"`. Tokenizers that do not list
    /// timestamp tokens explicitly get `timestamp_begin = no_timestamps + 1`,
    /// which is the layout of every released Whisper vocabulary.
    pub fn resolve(tokenizer: &dyn TextTokenizer, language: Option<&str>) -> CoreResult<Self> {
        let required = |tok: &str| {
            tokenizer
                .token_id(tok)
                .ok_or_else(|| CoreError::UnknownToken(tok.to_string()))
        };

        let no_timestamps = required(NO_TIMESTAMPS)?;
        let language = match language {
            Some(code) => Some(required(&format!("<|{code}|>"))?),
            None => None,
        };

        Ok(Self {
            start_of_transcript: required(START_OF_TRANSCRIPT)?,
            end_of_text: required(END_OF_TEXT)?,
            start_of_prev: required(START_OF_PREV)?,
            no_timestamps,
            transcribe: required(TRANSCRIBE)?,
            translate: tokenizer.token_id(TRANSLATE),
            language,
            timestamp_begin: tokenizer.token_id(FIRST_TIMESTAMP).unwrap_or(no_timestamps + 1),
        })
    }

    pub fn is_timestamp(&self, id: u32) -> bool {
        id >= self.timestamp_begin
    }

    /// Whisper pads label sequences with end-of-text.
    pub fn pad(&self) -> u32 {
        self.end_of_text
    }

    /// Control tokens that must never appear inside the transcript body.
    pub fn is_control(&self, id: u32) -> bool {
        id == self.start_of_transcript
            || id == self.end_of_text
            || id == self.start_of_prev
            || id == self.no_timestamps
            || id == self.transcribe
            || Some(id) == self.translate
            || Some(id) == self.language
    }

    /// Forced decoder prefix after `<|startoftranscript|>`:
    /// `[<|lang|>] <|transcribe|> [<|notimestamps|>]`.
    pub fn task_prefix(&self, predict_timestamps: bool) -> Vec<u32> {
        let mut prefix = Vec::with_capacity(3);
        prefix.extend(self.language);
        prefix.push(self.transcribe);
        if !predict_timestamps {
            prefix.push(self.no_timestamps);
        }
        prefix
    }
}
