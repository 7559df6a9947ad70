use std::path::Path;

use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Parameters for greedy decoding with [`Seq2SeqModel::generate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum number of tokens generated after the prompt.
    pub max_new_tokens: usize,
    /// Generation stops as soon as this id is produced (it is not returned).
    pub eos_token_id: u32,
    /// Hard cap on prompt + generated length (the decoder's position table).
    pub max_length: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            eos_token_id: 50257,
            max_length: 448,
        }
    }
}

/// An encoder-decoder speech model.
///
/// Both the teacher and the student implement this trait. The teacher is
/// usually loaded frozen (memory-mapped weights, no [`Var`]s), the student is
/// loaded into a `VarMap` so its parameters can be updated.
///
/// Shapes:
/// - `features`: `[batch, n_mels, frames]`
/// - encoder hidden states: `[batch, frames', d_model]`
/// - `decoder_input_ids`: `[batch, seq_len]` (u32)
/// - logits: `[batch, seq_len, vocab]`
pub trait Seq2SeqModel: Send {
    /// Run the audio encoder.
    fn encode(&mut self, features: &Tensor) -> CoreResult<Tensor>;

    /// Run the text decoder against pre-computed encoder hidden states and
    /// return per-position vocabulary logits.
    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_hidden: &Tensor) -> CoreResult<Tensor>;

    /// Full teacher-forced forward pass.
    fn forward(&mut self, features: &Tensor, decoder_input_ids: &Tensor) -> CoreResult<Tensor> {
        let hidden = self.encode(features)?;
        self.decode(decoder_input_ids, &hidden)
    }

    /// Greedy decoding for a single example (`features` has batch size 1).
    ///
    /// Returns only the generated ids; `prompt` (the forced decoder prefix) is
    /// not included.
    fn generate(
        &mut self,
        features: &Tensor,
        prompt: &[u32],
        params: &GenerationParams,
    ) -> CoreResult<Vec<u32>> {
        let hidden = self.encode(features)?;
        let mut tokens = prompt.to_vec();
        let mut generated = Vec::new();

        for _ in 0..params.max_new_tokens {
            if tokens.len() >= params.max_length {
                break;
            }
            let ids = Tensor::new(tokens.as_slice(), self.device())?.unsqueeze(0)?;
            let logits = self.decode(&ids, &hidden)?;
            let last = logits.i((0, tokens.len() - 1))?;
            let next = last.argmax(D::Minus1)?.to_scalar::<u32>()?;
            if next == params.eos_token_id {
                break;
            }
            tokens.push(next);
            generated.push(next);
        }

        Ok(generated)
    }

    /// Named trainable parameters. Frozen models return an empty list.
    fn named_vars(&self) -> Vec<(String, Var)>;

    /// Whether the parameter called `name` belongs to the audio encoder.
    fn is_encoder_param(&self, name: &str) -> bool;

    /// Enable or disable activation recomputation in the backward pass.
    ///
    /// Returns `true` when the model honours the request.
    fn set_gradient_checkpointing(&mut self, enabled: bool) -> bool {
        let _ = enabled;
        false
    }

    /// Dtype of the model weights; input features are cast to it.
    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;

    /// Write all parameters to a safetensors file.
    fn save_weights(&self, path: &Path) -> CoreResult<()>;

    /// Overwrite parameters from a safetensors file written by `save_weights`.
    fn load_weights(&mut self, path: &Path) -> CoreResult<()>;
}

/// Trainable parameters, optionally excluding the encoder.
///
/// Sorted by name so every worker iterates them in the same order.
pub fn trainable_vars(model: &dyn Seq2SeqModel, freeze_encoder: bool) -> Vec<(String, Var)> {
    let mut vars: Vec<(String, Var)> = model
        .named_vars()
        .into_iter()
        .filter(|(name, _)| !(freeze_encoder && model.is_encoder_param(name)))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_params_default_values() {
        let p = GenerationParams::default();
        assert_eq!(p.max_new_tokens, 128);
        assert_eq!(p.max_length, 448);
    }

    #[test]
    fn test_generation_params_serde_roundtrip() {
        let p = GenerationParams { max_new_tokens: 8, eos_token_id: 3, max_length: 32 };
        let json = serde_json::to_string(&p).unwrap();
        let back: GenerationParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.eos_token_id, 3);
        assert_eq!(back.max_length, 32);
    }
}
