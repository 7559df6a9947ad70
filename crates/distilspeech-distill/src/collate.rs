//! Batch collation.
//!
//! A [`Batch`] keeps its data in host buffers so it can cross the prefetch
//! channel; tensors are built on the training device by
//! [`Batch::to_tensors`].

use candle_core::{DType, Device, Tensor};

use crate::error::{DistillError, DistillResult};
use crate::preprocess::PreparedExample;

/// A padded group of examples.
///
/// Row-major layouts:
/// - `input_features`: `[batch, n_mels, frames]`
/// - `decoder_input_ids`, `labels`, `attention_mask`, `loss_mask`: `[batch, seq_len]`
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub batch_size: usize,
    pub n_mels: usize,
    pub frames: usize,
    pub seq_len: usize,
    pub input_features: Vec<f32>,
    pub decoder_input_ids: Vec<u32>,
    pub labels: Vec<u32>,
    /// 1.0 on real decoder positions, 0.0 on padding.
    pub attention_mask: Vec<f32>,
    /// 1.0 on positions that contribute to the loss (real target tokens).
    pub loss_mask: Vec<f32>,
    pub source_ids: Vec<String>,
    pub references: Vec<Option<String>>,
    /// Forced decoder prefix per row, used for generation during evaluation.
    pub generation_prompts: Vec<Vec<u32>>,
    /// Fewer than the configured batch size (the final batch of an epoch).
    pub partial: bool,
    /// Epoch the examples were drawn in.
    pub epoch: u64,
    /// Pipeline draws up to and including this batch; resuming replays
    /// exactly this many draws.
    pub drawn_through: u64,
}

/// Device tensors for one batch.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    pub input_features: Tensor,
    pub decoder_input_ids: Tensor,
    pub labels: Tensor,
    pub loss_mask: Tensor,
}

impl Batch {
    /// Number of positions that contribute to the loss.
    pub fn num_target_tokens(&self) -> usize {
        self.loss_mask.iter().filter(|&&m| m > 0.0).count()
    }

    /// Upload to `device`; features are cast to the model dtype.
    pub fn to_tensors(&self, device: &Device, dtype: DType) -> DistillResult<BatchTensors> {
        let b = self.batch_size;
        Ok(BatchTensors {
            input_features: Tensor::from_slice(&self.input_features, (b, self.n_mels, self.frames), device)?
                .to_dtype(dtype)?,
            decoder_input_ids: Tensor::from_slice(&self.decoder_input_ids, (b, self.seq_len), device)?,
            labels: Tensor::from_slice(&self.labels, (b, self.seq_len), device)?,
            loss_mask: Tensor::from_slice(&self.loss_mask, (b, self.seq_len), device)?,
        })
    }

    /// Features of row `i` as `[1, n_mels, frames]`.
    pub fn row_features(&self, i: usize, device: &Device, dtype: DType) -> DistillResult<Tensor> {
        let stride = self.n_mels * self.frames;
        let row = &self.input_features[i * stride..(i + 1) * stride];
        Ok(Tensor::from_slice(row, (1, self.n_mels, self.frames), device)?.to_dtype(dtype)?)
    }
}

/// Groups prepared examples into batches of at most `batch_size`.
pub struct Collator {
    batch_size: usize,
    pad_token_id: u32,
    feature_pad_value: f32,
    pending: Vec<PreparedExample>,
}

impl Collator {
    pub fn new(batch_size: usize, pad_token_id: u32, feature_pad_value: f32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pad_token_id,
            feature_pad_value,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Queue `example`; returns a full batch once `batch_size` are queued.
    pub fn push(&mut self, example: PreparedExample) -> DistillResult<Option<Batch>> {
        self.pending.push(example);
        if self.pending.len() < self.batch_size {
            return Ok(None);
        }
        let examples = std::mem::take(&mut self.pending);
        self.collate(&examples).map(Some)
    }

    /// Emit whatever is queued as a batch flagged `partial`.
    pub fn flush(&mut self) -> DistillResult<Option<Batch>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let examples = std::mem::take(&mut self.pending);
        self.collate(&examples).map(Some)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Pad `examples` into one batch, preserving their order.
    pub fn collate(&self, examples: &[PreparedExample]) -> DistillResult<Batch> {
        let first = examples
            .first()
            .ok_or_else(|| DistillError::BatchFailed { step: 0, reason: "cannot collate an empty batch".into() })?;
        let n_mels = first.n_mels;
        if let Some(bad) = examples.iter().find(|e| e.n_mels != n_mels) {
            return Err(DistillError::malformed(
                &bad.source_id,
                format!("{} mel bins in a batch of {n_mels}", bad.n_mels),
            ));
        }

        let b = examples.len();
        let frames = examples.iter().map(|e| e.frames).max().unwrap_or(0);
        let seq_len = examples.iter().map(|e| e.seq_len()).max().unwrap_or(0);

        let mut input_features = vec![self.feature_pad_value; b * n_mels * frames];
        let mut decoder_input_ids = vec![self.pad_token_id; b * seq_len];
        let mut labels = vec![self.pad_token_id; b * seq_len];
        let mut attention_mask = vec![0f32; b * seq_len];
        let mut loss_mask = vec![0f32; b * seq_len];

        for (row, ex) in examples.iter().enumerate() {
            for m in 0..n_mels {
                let src = &ex.input_features[m * ex.frames..(m + 1) * ex.frames];
                let dst = (row * n_mels + m) * frames;
                input_features[dst..dst + ex.frames].copy_from_slice(src);
            }

            let off = row * seq_len;
            let len = ex.seq_len();
            decoder_input_ids[off..off + len].copy_from_slice(&ex.decoder_input_ids);
            labels[off..off + len].copy_from_slice(&ex.labels);
            attention_mask[off..off + len].fill(1.0);
            loss_mask[off + ex.prompt_len()..off + len].fill(1.0);
        }

        Ok(Batch {
            batch_size: b,
            n_mels,
            frames,
            seq_len,
            input_features,
            decoder_input_ids,
            labels,
            attention_mask,
            loss_mask,
            source_ids: examples.iter().map(|e| e.source_id.clone()).collect(),
            references: examples.iter().map(|e| e.reference.clone()).collect(),
            generation_prompts: examples.iter().map(|e| e.generation_prompt.clone()).collect(),
            partial: b < self.batch_size,
            epoch: 0,
            drawn_through: 0,
        })
    }
}
