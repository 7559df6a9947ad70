//! Raw record → model-ready example.
//!
//! Token layout of one prepared example (Whisper convention):
//!
//! ```text
//! decoder input: [<|startofprev|> prev…] <|startoftranscript|> lang task [notimestamps] text…
//! labels:        [pad          … pad   ] lang task [notimestamps] text… <|endoftext|>
//! ```
//!
//! The previous-context prompt is optional and never contributes to the loss.
//! Two independent uniform draws per example decide whether timestamps are
//! kept and whether previous context is injected; the draws come from a
//! seeded generator so the output is reproducible given seed and example
//! order.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use distilspeech_core::{SpecialTokens, TextTokenizer};

use crate::error::{DistillError, DistillResult};
use crate::source::{PseudoLabel, RawExample};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Probability of keeping timestamp tokens when the label has them.
    pub timestamp_probability: f64,
    /// Probability of conditioning on the previous segment's text.
    pub condition_on_prev_probability: f64,
    /// Upper bound on decoder length (prompt + labels).
    pub max_label_length: usize,
    /// Train on the teacher's pseudo-labels rather than the ground truth.
    pub use_pseudo_labels: bool,
    /// Language code forced into the decoder prefix, e.g. `en`.
    pub language: Option<String>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            timestamp_probability: 0.2,
            condition_on_prev_probability: 0.2,
            max_label_length: 448,
            use_pseudo_labels: true,
            language: None,
        }
    }
}

/// A tokenised example ready for collation.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExample {
    /// Row-major `[n_mels, frames]`.
    pub input_features: Vec<f32>,
    pub n_mels: usize,
    pub frames: usize,
    /// `[<|startofprev|> prev…]`, empty when no context was injected.
    pub prompt_ids: Vec<u32>,
    /// Task prefix, transcript and `<|endoftext|>`. Never empty.
    pub target_ids: Vec<u32>,
    /// `prompt_ids ++ [<|startoftranscript|>] ++ target_ids[..n-1]`.
    pub decoder_input_ids: Vec<u32>,
    /// `[pad; prompt_len] ++ target_ids`, same length as the decoder input.
    pub labels: Vec<u32>,
    /// `prompt_ids ++ [<|startoftranscript|>] ++ task prefix`: what a
    /// generating model is forced to start from.
    pub generation_prompt: Vec<u32>,
    pub timestamps_kept: bool,
    pub source_id: String,
    pub reference: Option<String>,
    /// Plain text of the training target, for filtering and evaluation.
    pub label_text: String,
}

impl PreparedExample {
    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    pub fn seq_len(&self) -> usize {
        self.labels.len()
    }
}

pub struct Preprocessor {
    config: PreprocessConfig,
    tokenizer: Arc<dyn TextTokenizer>,
    special: SpecialTokens,
    rng: StdRng,
}

impl Preprocessor {
    pub fn new(
        config: PreprocessConfig,
        tokenizer: Arc<dyn TextTokenizer>,
        special: SpecialTokens,
        seed: u64,
    ) -> Self {
        Self { config, tokenizer, special, rng: StdRng::seed_from_u64(seed) }
    }

    /// Tokenise `raw`. Errors are [`DistillError::MalformedExample`] unless
    /// the tokenizer itself fails.
    pub fn prepare(&mut self, raw: &RawExample) -> DistillResult<PreparedExample> {
        // Both draws happen for every example so the stream of decisions
        // depends only on the seed and the example order.
        let ts_draw: f64 = self.rng.gen();
        let prev_draw: f64 = self.rng.gen();

        let (body, label_text) = self.label_ids(raw)?;

        let has_timestamps = body.iter().any(|&id| self.special.is_timestamp(id));
        let keep_timestamps = has_timestamps && ts_draw < self.config.timestamp_probability;
        let body: Vec<u32> = if keep_timestamps {
            body
        } else {
            body.into_iter().filter(|&id| !self.special.is_timestamp(id)).collect()
        };
        if body.is_empty() {
            return Err(DistillError::malformed(&raw.source_id, format!("record {}: empty target", raw.index)));
        }

        let task_prefix = self.special.task_prefix(keep_timestamps);
        let mut target_ids = task_prefix.clone();
        target_ids.extend(body);
        target_ids.push(self.special.end_of_text);

        let max_len = self.config.max_label_length;
        if target_ids.len() > max_len {
            return Err(DistillError::malformed(
                &raw.source_id,
                format!("record {}: label length {} exceeds {max_len}", raw.index, target_ids.len()),
            ));
        }

        let prompt_ids = match &raw.prev_text {
            Some(prev) if prev_draw < self.config.condition_on_prev_probability => {
                self.prompt(prev, max_len - target_ids.len())?
            }
            _ => Vec::new(),
        };

        let features = raw.features.load()?;

        let mut decoder_input_ids = prompt_ids.clone();
        decoder_input_ids.push(self.special.start_of_transcript);
        decoder_input_ids.extend_from_slice(&target_ids[..target_ids.len() - 1]);

        let mut labels = vec![self.special.pad(); prompt_ids.len()];
        labels.extend_from_slice(&target_ids);

        let generation_prompt = decoder_input_ids[..prompt_ids.len() + 1 + task_prefix.len()].to_vec();

        Ok(PreparedExample {
            input_features: features.values,
            n_mels: features.n_mels,
            frames: features.frames,
            prompt_ids,
            target_ids,
            decoder_input_ids,
            labels,
            generation_prompt,
            timestamps_kept: keep_timestamps,
            source_id: raw.source_id.clone(),
            reference: raw.reference.clone(),
            label_text,
        })
    }

    /// Consume the random draws [`Preprocessor::prepare`] would make for one
    /// example, without tokenising anything.
    pub fn skip_example(&mut self) {
        let _: f64 = self.rng.gen();
        let _: f64 = self.rng.gen();
    }

    /// Restart the random stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Transcript ids (no control tokens) and their plain text.
    fn label_ids(&self, raw: &RawExample) -> DistillResult<(Vec<u32>, String)> {
        let missing = |what: &str| DistillError::malformed(&raw.source_id, format!("record {}: no {what}", raw.index));

        let (ids, text) = if self.config.use_pseudo_labels {
            match raw.pseudo_label.as_ref().ok_or_else(|| missing("pseudo-label"))? {
                PseudoLabel::Text(text) => (self.tokenizer.encode(text)?, text.clone()),
                PseudoLabel::Ids(ids) => (ids.clone(), self.tokenizer.decode(ids, true)?),
            }
        } else {
            let text = raw.reference.as_ref().ok_or_else(|| missing("reference text"))?;
            (self.tokenizer.encode(text)?, text.clone())
        };

        let ids = ids.into_iter().filter(|&id| !self.special.is_control(id)).collect();
        Ok((ids, text))
    }

    /// `<|startofprev|>` followed by the tail of `prev` that fits in `room`
    /// tokens (and in half the decoder context).
    fn prompt(&self, prev: &str, room: usize) -> DistillResult<Vec<u32>> {
        let prev_ids: Vec<u32> = self
            .tokenizer
            .encode(prev)?
            .into_iter()
            .filter(|&id| !self.special.is_control(id) && !self.special.is_timestamp(id))
            .collect();

        let budget = room.min(self.config.max_label_length / 2).saturating_sub(1);
        if prev_ids.is_empty() || budget == 0 {
            return Ok(Vec::new());
        }
        let tail = &prev_ids[prev_ids.len().saturating_sub(budget)..];

        let mut prompt = Vec::with_capacity(tail.len() + 1);
        prompt.push(self.special.start_of_prev);
        prompt.extend_from_slice(tail);
        Ok(prompt)
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }
}
