use serde::{Deserialize, Serialize};

/// Learning-rate schedule shape after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    #[default]
    ConstantWithWarmup,
    Linear,
}

impl std::str::FromStr for LrSchedulerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant_with_warmup" => Ok(Self::ConstantWithWarmup),
            "linear" => Ok(Self::Linear),
            other => Err(format!(
                "Unknown lr_scheduler_type '{other}'. Valid values: constant_with_warmup, linear."
            )),
        }
    }
}

/// Linear warmup from 0 to `peak_lr` over `warmup_steps`, then either
/// constant or linear decay to 0 at `max_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub kind: LrSchedulerType,
    pub peak_lr: f64,
    pub warmup_steps: u64,
    pub max_steps: u64,
}

impl LrSchedule {
    pub fn new(kind: LrSchedulerType, peak_lr: f64, warmup_steps: u64, max_steps: u64) -> Self {
        Self { kind, peak_lr, warmup_steps, max_steps }
    }

    /// Learning rate for the update made after `step` completed steps.
    pub fn lr_at(&self, step: u64) -> f64 {
        if step < self.warmup_steps {
            return self.peak_lr * step as f64 / self.warmup_steps as f64;
        }
        match self.kind {
            LrSchedulerType::ConstantWithWarmup => self.peak_lr,
            LrSchedulerType::Linear => {
                let remaining = self.max_steps.saturating_sub(step) as f64;
                let span = self.max_steps.saturating_sub(self.warmup_steps).max(1) as f64;
                self.peak_lr * remaining / span
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_with_warmup() {
        let s = LrSchedule::new(LrSchedulerType::ConstantWithWarmup, 1e-4, 50, 1000);
        assert_eq!(s.lr_at(0), 0.0);
        assert!((s.lr_at(25) - 5e-5).abs() < 1e-12);
        assert_eq!(s.lr_at(50), 1e-4);
        assert_eq!(s.lr_at(999), 1e-4);
        assert_eq!(s.lr_at(5000), 1e-4);
    }

    #[test]
    fn warmup_is_monotonic() {
        let s = LrSchedule::new(LrSchedulerType::ConstantWithWarmup, 3e-4, 50, 100);
        for step in 0..50 {
            assert!(s.lr_at(step) < s.lr_at(step + 1));
        }
    }

    #[test]
    fn linear_decays_to_zero() {
        let s = LrSchedule::new(LrSchedulerType::Linear, 1e-4, 10, 110);
        assert_eq!(s.lr_at(0), 0.0);
        assert!((s.lr_at(10) - 1e-4).abs() < 1e-12);
        assert!((s.lr_at(60) - 5e-5).abs() < 1e-12);
        assert_eq!(s.lr_at(110), 0.0);
        assert_eq!(s.lr_at(200), 0.0);
    }

    #[test]
    fn no_warmup_starts_at_peak() {
        let s = LrSchedule::new(LrSchedulerType::Linear, 2e-4, 0, 100);
        assert!((s.lr_at(0) - 2e-4).abs() < 1e-12);
    }

    #[test]
    fn parse_scheduler_names() {
        assert_eq!("linear".parse::<LrSchedulerType>().unwrap(), LrSchedulerType::Linear);
        assert_eq!(
            "constant_with_warmup".parse::<LrSchedulerType>().unwrap(),
            LrSchedulerType::ConstantWithWarmup
        );
        assert!("cosine".parse::<LrSchedulerType>().is_err());
    }
}
