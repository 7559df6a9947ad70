//! Teacher/student objective.
//!
//! ```text
//! loss = α · CE(student, labels) + (1 − α) · T² · KL(softmax(teacher/T) ‖ softmax(student/T))
//! ```
//!
//! Both terms are averaged over the positions selected by the loss mask, so
//! padding and previous-context prompts never contribute. Logits are cast to
//! F32 before any softmax; BF16 overflows in `exp` over a 50k vocabulary.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;
use serde::{Deserialize, Serialize};
use tracing::debug;

use distilspeech_core::Seq2SeqModel;

use crate::collate::BatchTensors;
use crate::error::{DistillError, DistillResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Weight of the cross-entropy term; `1 − alpha` weighs the KL term.
    pub alpha: f64,
    /// Softmax temperature for the KL term.
    pub temperature: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { alpha: 0.8, temperature: 2.0 }
    }
}

/// Scalar values of one loss evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub total: f32,
    pub ce: f32,
    /// Unscaled KL divergence (before the `T²` factor).
    pub kl: f32,
}

fn to_f32(t: &Tensor) -> candle_core::Result<Tensor> {
    if t.dtype() == DType::F32 {
        Ok(t.clone())
    } else {
        t.to_dtype(DType::F32)
    }
}

/// Mean of `values` over the positions where `mask` is 1.
fn masked_mean(values: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let denom = mask.sum_all()?.to_scalar::<f32>()?.max(1.0);
    (values * mask)?.sum_all()? / denom as f64
}

/// Token-level cross-entropy averaged over masked positions.
///
/// `logits`: `[b, L, V]`, `labels`: `[b, L]` (u32), `mask`: `[b, L]` (f32).
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = log_softmax(&to_f32(logits)?, D::Minus1)?;
    let nll = log_probs
        .gather(&labels.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?
        .neg()?;
    masked_mean(&nll, &to_f32(mask)?)
}

/// `KL(p_teacher ‖ p_student)` at temperature `t`, averaged over masked
/// positions. Not multiplied by `t²`.
pub fn masked_kl_divergence(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    mask: &Tensor,
    temperature: f64,
) -> candle_core::Result<Tensor> {
    let inv_t = 1.0 / temperature;
    let log_p = log_softmax(&to_f32(teacher_logits)?.affine(inv_t, 0.0)?, D::Minus1)?;
    let log_q = log_softmax(&to_f32(student_logits)?.affine(inv_t, 0.0)?, D::Minus1)?;
    let per_position = (log_p.exp()? * (&log_p - &log_q)?)?.sum(D::Minus1)?;
    masked_mean(&per_position, &to_f32(mask)?)
}

/// The combined objective for fixed `alpha` and `temperature`.
#[derive(Debug, Clone)]
pub struct DistillLoss {
    config: LossConfig,
}

impl DistillLoss {
    pub fn new(config: LossConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LossConfig {
        &self.config
    }

    /// Whether the KL term has any weight.
    pub fn uses_teacher(&self) -> bool {
        self.config.alpha < 1.0
    }

    /// Combined loss at `step`. `teacher_logits` may be `None` only when
    /// `alpha == 1`.
    ///
    /// A non-finite total is [`DistillError::LossDivergence`].
    pub fn compute(
        &self,
        student_logits: &Tensor,
        teacher_logits: Option<&Tensor>,
        labels: &Tensor,
        loss_mask: &Tensor,
        step: u64,
    ) -> DistillResult<(Tensor, LossBreakdown)> {
        let alpha = self.config.alpha;
        let t = self.config.temperature;

        let ce = masked_cross_entropy(student_logits, labels, loss_mask)?;
        let (total, kl_value) = match teacher_logits {
            Some(teacher) if self.uses_teacher() => {
                let kl = masked_kl_divergence(student_logits, teacher, loss_mask, t)?;
                let kl_value = kl.to_scalar::<f32>()?;
                let total = (ce.affine(alpha, 0.0)? + kl.affine((1.0 - alpha) * t * t, 0.0)?)?;
                (total, kl_value)
            }
            None if self.uses_teacher() => {
                return Err(DistillError::invalid("loss.alpha", "teacher logits required when alpha < 1"))
            }
            _ => (ce.affine(alpha, 0.0)?, 0.0),
        };

        let breakdown = LossBreakdown {
            total: total.to_scalar::<f32>()?,
            ce: ce.to_scalar::<f32>()?,
            kl: kl_value,
        };
        if !breakdown.total.is_finite() {
            return Err(DistillError::LossDivergence { step, value: breakdown.total });
        }
        Ok((total, breakdown))
    }
}

/// Output of one teacher + student pass.
pub struct LossOutput {
    /// Scalar loss with the student's autograd graph attached.
    pub loss: Tensor,
    pub breakdown: LossBreakdown,
}

/// Runs the teacher (no gradient) and the student on a batch and evaluates
/// [`DistillLoss`].
pub struct LossEngine {
    loss: DistillLoss,
    freeze_encoder: bool,
}

impl LossEngine {
    pub fn new(loss: DistillLoss, freeze_encoder: bool) -> Self {
        Self { loss, freeze_encoder }
    }

    pub fn loss(&self) -> &DistillLoss {
        &self.loss
    }

    /// With `freeze_encoder` the student decodes against the teacher's
    /// encoder output; its own encoder is never run.
    pub fn forward(
        &self,
        teacher: &mut dyn Seq2SeqModel,
        student: &mut dyn Seq2SeqModel,
        batch: &BatchTensors,
        step: u64,
    ) -> DistillResult<LossOutput> {
        let need_teacher = self.loss.uses_teacher() || self.freeze_encoder;

        let (teacher_hidden, teacher_logits) = if need_teacher {
            let features = batch.input_features.to_dtype(teacher.dtype())?;
            let hidden = teacher.encode(&features)?.detach();
            let logits = if self.loss.uses_teacher() {
                Some(teacher.decode(&batch.decoder_input_ids, &hidden)?.detach())
            } else {
                None
            };
            (Some(hidden), logits)
        } else {
            (None, None)
        };

        let student_logits = match (&teacher_hidden, self.freeze_encoder) {
            (Some(hidden), true) => {
                let hidden = hidden.to_dtype(student.dtype())?;
                student.decode(&batch.decoder_input_ids, &hidden)?
            }
            _ => {
                let features = batch.input_features.to_dtype(student.dtype())?;
                student.forward(&features, &batch.decoder_input_ids)?
            }
        };

        let (loss, breakdown) =
            self.loss
                .compute(&student_logits, teacher_logits.as_ref(), &batch.labels, &batch.loss_mask, step)?;
        debug!(step, total = breakdown.total, ce = breakdown.ce, kl = breakdown.kl, "Loss computed");
        Ok(LossOutput { loss, breakdown })
    }
}
