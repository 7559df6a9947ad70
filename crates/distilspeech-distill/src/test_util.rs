//! Small CPU stand-ins for the model and tokenizer collaborators.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use distilspeech_core::tokenizer::{END_OF_TEXT, NO_TIMESTAMPS, START_OF_PREV, START_OF_TRANSCRIPT, TRANSCRIBE, TRANSLATE};
use distilspeech_core::{CoreError, CoreResult, Seq2SeqModel, SpecialTokens, TextTokenizer};

/// Word-level tokenizer over a fixed vocabulary.
///
/// Ids: words `0..n`, then `eot`, `sot`, `startofprev`, `transcribe`,
/// `translate`, `notimestamps`, then [`WordTokenizer::TIMESTAMPS`] timestamp
/// tokens.
pub struct WordTokenizer {
    words: Vec<String>,
    index: HashMap<String, u32>,
    specials: Vec<&'static str>,
}

impl WordTokenizer {
    pub const TIMESTAMPS: usize = 4;

    pub fn new(words: &[&str]) -> Self {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        let index = words.iter().enumerate().map(|(i, w)| (w.clone(), i as u32)).collect();
        Self {
            words,
            index,
            specials: vec![END_OF_TEXT, START_OF_TRANSCRIPT, START_OF_PREV, TRANSCRIBE, TRANSLATE, NO_TIMESTAMPS],
        }
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> CoreResult<Vec<u32>> {
        text.split_whitespace()
            .map(|w| {
                self.index
                    .get(&w.to_lowercase())
                    .copied()
                    .ok_or_else(|| CoreError::Tokenizer(format!("unknown word '{w}'")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> CoreResult<String> {
        let n = self.words.len();
        let mut out = Vec::new();
        for &id in ids {
            let i = id as usize;
            if i < n {
                out.push(self.words[i].clone());
            } else if !skip_special_tokens {
                match self.specials.get(i - n) {
                    Some(s) => out.push(s.to_string()),
                    None => out.push(format!("<|{:.2}|>", (i - n - self.specials.len()) as f32 * 0.02)),
                }
            }
        }
        Ok(out.join(" "))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        let n = self.words.len();
        self.specials
            .iter()
            .position(|s| *s == token)
            .map(|p| (n + p) as u32)
            .or_else(|| self.index.get(token).copied())
    }

    fn vocab_size(&self) -> usize {
        self.words.len() + self.specials.len() + Self::TIMESTAMPS
    }
}

pub fn special_tokens(tokenizer: &dyn TextTokenizer) -> SpecialTokens {
    SpecialTokens::resolve(tokenizer, None).expect("word tokenizer has every control token")
}

/// A one-layer encoder-decoder with deterministic initial weights.
///
/// encoder: `tanh(Linear(n_mels → d))` over frames.
/// decoder: `Linear(d → vocab)(tanh(embed(ids) + mean(encoder)))`.
pub struct TinySeq2Seq {
    encoder: Linear,
    embed: Embedding,
    out: Linear,
    varmap: VarMap,
    device: Device,
}

impl TinySeq2Seq {
    pub fn new(n_mels: usize, d_model: usize, vocab: usize, seed: u64) -> candle_core::Result<Self> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = candle_nn::linear(n_mels, d_model, vb.pp("encoder.proj"))?;
        let embed = candle_nn::embedding(vocab, d_model, vb.pp("decoder.embed"))?;
        let out = candle_nn::linear(d_model, vocab, vb.pp("decoder.out"))?;

        let mut rng = StdRng::seed_from_u64(seed);
        {
            let data = varmap.data().lock().expect("fresh varmap");
            let mut names: Vec<&String> = data.keys().collect();
            names.sort();
            for name in names {
                let var = &data[name];
                let values: Vec<f32> = (0..var.elem_count()).map(|_| rng.gen_range(-0.3..0.3)).collect();
                var.set(&Tensor::from_vec(values, var.shape(), &device)?)?;
            }
        }

        Ok(Self { encoder, embed, out, varmap, device })
    }

    /// Number of decoder output classes.
    pub fn vocab(&self) -> usize {
        self.embed.embeddings().dim(0).unwrap_or(0)
    }
}

impl Seq2SeqModel for TinySeq2Seq {
    fn encode(&mut self, features: &Tensor) -> CoreResult<Tensor> {
        Ok(self.encoder.forward(&features.transpose(1, 2)?.contiguous()?)?.tanh()?)
    }

    fn decode(&mut self, decoder_input_ids: &Tensor, encoder_hidden: &Tensor) -> CoreResult<Tensor> {
        let context = encoder_hidden.mean_keepdim(1)?;
        let h = self.embed.forward(decoder_input_ids)?.broadcast_add(&context)?.tanh()?;
        Ok(self.out.forward(&h)?)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        match self.varmap.data().lock() {
            Ok(data) => data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn is_encoder_param(&self, name: &str) -> bool {
        name.starts_with("encoder.")
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn save_weights(&self, path: &Path) -> CoreResult<()> {
        Ok(self.varmap.save(path)?)
    }

    fn load_weights(&mut self, path: &Path) -> CoreResult<()> {
        Ok(self.varmap.load(path)?)
    }
}

/// Vocabulary shared by the end-to-end tests.
pub const WORDS: &[&str] = &["the", "cat", "sat", "on", "a", "mat", "dog", "ran", "far", "away", "big", "red"];

/// Write `records` as JSONL to `dir/file_name`.
pub fn write_jsonl(dir: &Path, file_name: &str, records: &[serde_json::Value]) {
    std::fs::create_dir_all(dir).expect("create dataset dir");
    let body: Vec<String> = records.iter().map(|r| r.to_string()).collect();
    std::fs::write(dir.join(file_name), body.join("\n")).expect("write dataset");
}

/// A record with inline `[n_mels][frames]` features.
pub fn record(n_mels: usize, frames: usize, text: &str, pseudo: &str) -> serde_json::Value {
    let features: Vec<Vec<f32>> = (0..n_mels)
        .map(|m| (0..frames).map(|f| ((m * frames + f) % 7) as f32 / 7.0).collect())
        .collect();
    serde_json::json!({
        "input_features": features,
        "text": text,
        "whisper_transcript": pseudo,
    })
}
