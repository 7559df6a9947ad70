//! # distilspeech-core
//!
//! Collaborator abstractions for the distillation pipeline: compute devices,
//! encoder-decoder speech models, tokenization and text normalisation.
//!
//! ## Supported Architectures
//!
//! | Architecture | Format | Struct |
//! |--------------|--------|--------|
//! | Whisper | Safetensors + `config.json` | [`WhisperModel`] |
//!
//! Any other encoder-decoder model can take part in distillation by
//! implementing [`Seq2SeqModel`].
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod device;
pub mod error;
pub mod model;
pub mod normalizer;
pub mod tokenizer;
pub mod whisper;

pub use device::{device_name, select_device, training_dtype};
pub use error::{CoreError, CoreResult};
pub use model::{trainable_vars, GenerationParams, Seq2SeqModel};
pub use normalizer::{BasicTextNormalizer, TextNormalizer};
pub use tokenizer::{SpecialTokens, TextTokenizer, WhisperTokenizer};
pub use whisper::WhisperModel;
