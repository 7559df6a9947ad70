//! AdamW with decoupled weight decay and persistable moment estimates.
//!
//! Moments are kept in F32 regardless of the parameter dtype, and the
//! update itself is computed in F32 before being cast back, so BF16
//! parameters do not accumulate rounding error in the optimizer state.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DistillError, DistillResult};

const STEP_KEY: &str = "__step__";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamWParams {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self { beta1: 0.9, beta2: 0.999, eps: 1e-8, weight_decay: 0.0 }
    }
}

pub struct AdamW {
    vars: Vec<(String, Var)>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    params: AdamWParams,
    t: u64,
}

impl AdamW {
    /// `vars` fixes the parameter order; gradients passed to [`AdamW::step`]
    /// must follow it.
    pub fn new(vars: Vec<(String, Var)>, params: AdamWParams) -> DistillResult<Self> {
        let mut exp_avg = Vec::with_capacity(vars.len());
        let mut exp_avg_sq = Vec::with_capacity(vars.len());
        for (_, var) in &vars {
            exp_avg.push(Tensor::zeros(var.shape(), DType::F32, var.device())?);
            exp_avg_sq.push(Tensor::zeros(var.shape(), DType::F32, var.device())?);
        }
        Ok(Self { vars, exp_avg, exp_avg_sq, params, t: 0 })
    }

    pub fn vars(&self) -> &[(String, Var)] {
        &self.vars
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u64 {
        self.t
    }

    /// Apply one update with learning rate `lr`. `grads[i]` is the F32
    /// gradient of `vars()[i]`.
    pub fn step(&mut self, grads: &[Tensor], lr: f64) -> DistillResult<()> {
        if grads.len() != self.vars.len() {
            return Err(DistillError::BatchFailed {
                step: self.t,
                reason: format!("{} gradients for {} parameters", grads.len(), self.vars.len()),
            });
        }

        self.t += 1;
        let AdamWParams { beta1, beta2, eps, weight_decay } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.t as i32));

        for (i, ((_, var), grad)) in self.vars.iter().zip(grads).enumerate() {
            let g = grad.to_dtype(DType::F32)?;
            let m = ((&self.exp_avg[i] * beta1)? + (&g * (1.0 - beta1))?)?;
            let v = ((&self.exp_avg_sq[i] * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m * scale_m)?;
            let v_hat = (&v * scale_v)?;
            let theta = var.as_tensor().to_dtype(DType::F32)?;
            let theta = (theta * (1.0 - lr * weight_decay))?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let theta = (theta - (update * lr)?)?;

            var.set(&theta.to_dtype(var.dtype())?)?;
            self.exp_avg[i] = m;
            self.exp_avg_sq[i] = v;
        }
        Ok(())
    }

    /// Moment estimates keyed `<param>.exp_avg` / `<param>.exp_avg_sq`, plus
    /// the update counter.
    pub fn state_tensors(&self) -> DistillResult<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(self.vars.len() * 2 + 1);
        for (i, (name, _)) in self.vars.iter().enumerate() {
            state.insert(format!("{name}.exp_avg"), self.exp_avg[i].clone());
            state.insert(format!("{name}.exp_avg_sq"), self.exp_avg_sq[i].clone());
        }
        state.insert(STEP_KEY.to_string(), Tensor::new(&[self.t as i64], &Device::Cpu)?);
        Ok(state)
    }

    pub fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>) -> DistillResult<()> {
        let get = |key: &str| {
            state
                .get(key)
                .ok_or_else(|| DistillError::Checkpoint(format!("optimizer state is missing `{key}`")))
        };
        for (i, (name, var)) in self.vars.iter().enumerate() {
            let m = get(&format!("{name}.exp_avg"))?;
            let v = get(&format!("{name}.exp_avg_sq"))?;
            if m.dims() != var.dims() || v.dims() != var.dims() {
                return Err(DistillError::Checkpoint(format!(
                    "optimizer state for `{name}` has shape {:?}, parameter has {:?}",
                    m.dims(),
                    var.dims()
                )));
            }
            self.exp_avg[i] = m.to_dtype(DType::F32)?.to_device(var.device())?;
            self.exp_avg_sq[i] = v.to_dtype(DType::F32)?.to_device(var.device())?;
        }
        self.t = get(STEP_KEY)?.to_vec1::<i64>()?.first().copied().unwrap_or(0).max(0) as u64;
        debug!(params = self.vars.len(), step = self.t, "Optimizer state restored");
        Ok(())
    }

    pub fn save(&self, path: &Path) -> DistillResult<()> {
        candle_core::safetensors::save(&self.state_tensors()?, path)?;
        Ok(())
    }

    pub fn load(&mut self, path: &Path) -> DistillResult<()> {
        let state = candle_core::safetensors::load(path, &Device::Cpu)?;
        self.load_state_tensors(&state)
    }
}

/// Scale `grads` in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. `max_norm <= 0` disables clipping.
pub fn clip_grad_norm(grads: &mut [Tensor], max_norm: f64) -> DistillResult<f64> {
    let mut sum_sq = 0f64;
    for g in grads.iter() {
        sum_sq += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
    }
    let norm = sum_sq.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for g in grads.iter_mut() {
            *g = (&*g * scale)?;
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn var(values: &[f32]) -> Var {
        Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap()
    }

    fn values(v: &Var) -> Vec<f32> {
        v.as_tensor().to_vec1::<f32>().unwrap()
    }

    /// Gradient of `sum(x²)`.
    fn quad_grad(v: &Var) -> Tensor {
        (v.as_tensor() * 2.0).unwrap()
    }

    #[test]
    fn minimises_quadratic() {
        let x = var(&[3.0, -2.0]);
        let mut opt = AdamW::new(vec![("x".into(), x.clone())], AdamWParams::default()).unwrap();
        for _ in 0..300 {
            let g = quad_grad(&x);
            opt.step(&[g], 0.05).unwrap();
        }
        assert!(values(&x).iter().all(|v| v.abs() < 0.1), "{:?}", values(&x));
        assert_eq!(opt.step_count(), 300);
    }

    #[test]
    fn first_step_moves_by_lr() {
        // with bias correction the first Adam update is lr · sign(g)
        let x = var(&[1.0, -1.0]);
        let mut opt = AdamW::new(vec![("x".into(), x.clone())], AdamWParams::default()).unwrap();
        opt.step(&[Tensor::new(&[0.5f32, -4.0], &Device::Cpu).unwrap()], 0.1).unwrap();
        let v = values(&x);
        assert!((v[0] - 0.9).abs() < 1e-4);
        assert!((v[1] + 0.9).abs() < 1e-4);
    }

    #[test]
    fn decoupled_weight_decay_shrinks_without_gradient() {
        let x = var(&[2.0]);
        let params = AdamWParams { weight_decay: 0.5, ..Default::default() };
        let mut opt = AdamW::new(vec![("x".into(), x.clone())], params).unwrap();
        opt.step(&[Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap()], 0.1).unwrap();
        assert!((values(&x)[0] - 1.9).abs() < 1e-5);
    }

    #[test]
    fn restored_state_reproduces_next_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("optimizer.safetensors");

        let a = var(&[1.0, 2.0]);
        let mut opt_a = AdamW::new(vec![("w".into(), a.clone())], AdamWParams::default()).unwrap();
        for _ in 0..3 {
            opt_a.step(&[quad_grad(&a)], 0.01).unwrap();
        }
        opt_a.save(&path).unwrap();

        let b = var(&values(&a));
        let mut opt_b = AdamW::new(vec![("w".into(), b.clone())], AdamWParams::default()).unwrap();
        opt_b.load(&path).unwrap();
        assert_eq!(opt_b.step_count(), 3);

        opt_a.step(&[quad_grad(&a)], 0.01).unwrap();
        opt_b.step(&[quad_grad(&b)], 0.01).unwrap();
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn load_rejects_missing_params() {
        let mut opt = AdamW::new(vec![("w".into(), var(&[1.0]))], AdamWParams::default()).unwrap();
        let err = opt.load_state_tensors(&HashMap::new()).unwrap_err();
        assert!(matches!(err, DistillError::Checkpoint(_)));
    }

    #[test]
    fn gradient_count_must_match() {
        let mut opt = AdamW::new(vec![("w".into(), var(&[1.0]))], AdamWParams::default()).unwrap();
        assert!(opt.step(&[], 0.1).is_err());
    }

    #[test]
    fn clipping_scales_to_max_norm() {
        let mut grads = vec![
            Tensor::new(&[3.0f32], &Device::Cpu).unwrap(),
            Tensor::new(&[4.0f32], &Device::Cpu).unwrap(),
        ];
        let norm = clip_grad_norm(&mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped: f32 = grads.iter().map(|g| g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()).sum();
        assert!((clipped.sqrt() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn clipping_leaves_small_gradients() {
        let mut grads = vec![Tensor::new(&[0.3f32, 0.4], &Device::Cpu).unwrap()];
        let norm = clip_grad_norm(&mut grads, 1.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
        assert_eq!(grads[0].to_vec1::<f32>().unwrap(), vec![0.3, 0.4]);
    }
}
