//! Weighted interleaving of several example sources.
//!
//! Training draws are randomised: at each draw a source is picked with
//! probability proportional to its weight, re-normalised over the sources
//! still in the pool. Evaluation draws are sequential: sources are read one
//! after another in descriptor order.
//!
//! What happens when a finite source runs dry is an explicit
//! [`ExhaustionPolicy`].

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DistillError, DistillResult};
use crate::source::{ExampleSource, RawExample};

/// Behaviour of the mixer when one source has no more examples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Restart the source from the beginning (oversampling small sources).
    #[default]
    Recycle,
    /// Drop the source from the pool; the epoch ends when the pool is empty.
    Exhaust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MixOrder {
    /// Random source per draw, proportional to weight (training).
    Weighted,
    /// Sources in order, each read to the end (evaluation).
    Sequential,
}

pub struct WeightedMixer {
    sources: Vec<Box<dyn ExampleSource>>,
    weights: Vec<f64>,
    active: Vec<bool>,
    passes: Vec<u64>,
    drawn_per_source: Vec<u64>,
    order: MixOrder,
    policy: ExhaustionPolicy,
    rng: StdRng,
    seed: u64,
    cursor: usize,
    drawn: u64,
}

impl WeightedMixer {
    pub fn new(
        sources: Vec<Box<dyn ExampleSource>>,
        weights: Vec<f64>,
        order: MixOrder,
        policy: ExhaustionPolicy,
        seed: u64,
    ) -> DistillResult<Self> {
        if sources.is_empty() {
            return Err(DistillError::invalid("dataset", "the mixer needs at least one source"));
        }
        if weights.len() != sources.len() {
            return Err(DistillError::ConfigMismatch {
                field: "dataset_samples".to_string(),
                expected: sources.len(),
                got: weights.len(),
            });
        }
        if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(DistillError::invalid("dataset_samples", "weights must be positive"));
        }

        let total: f64 = weights.iter().sum();
        for (src, w) in sources.iter().zip(&weights) {
            info!(
                source = %src.id(),
                weight = w,
                probability = format!("{:.3}", w / total),
                records = ?src.len_hint(),
                "Mixer source"
            );
        }

        let n = sources.len();
        Ok(Self {
            sources,
            weights,
            active: vec![true; n],
            passes: vec![0; n],
            drawn_per_source: vec![0; n],
            order,
            policy,
            rng: StdRng::seed_from_u64(seed),
            seed,
            cursor: 0,
            drawn: 0,
        })
    }

    /// Draw the next example.
    ///
    /// Returns [`DistillError::SourceExhausted`] once no source can supply
    /// anything more. Malformed records are passed through as errors.
    pub fn next_example(&mut self) -> DistillResult<RawExample> {
        match self.order {
            MixOrder::Weighted => self.next_weighted(),
            MixOrder::Sequential => self.next_sequential(),
        }
    }

    fn next_weighted(&mut self) -> DistillResult<RawExample> {
        loop {
            let pool: Vec<usize> = (0..self.sources.len()).filter(|&i| self.active[i]).collect();
            if pool.is_empty() {
                return Err(DistillError::SourceExhausted { drawn: self.drawn });
            }
            let dist = WeightedIndex::new(pool.iter().map(|&i| self.weights[i]))
                .map_err(|e| DistillError::invalid("dataset_samples", e.to_string()))?;
            let i = pool[dist.sample(&mut self.rng)];

            if let Some(item) = self.sources[i].next_example() {
                return self.record_draw(i, item);
            }

            match self.policy {
                ExhaustionPolicy::Exhaust => {
                    info!(source = %self.sources[i].id(), drawn = self.drawn_per_source[i], "Source exhausted");
                    self.active[i] = false;
                }
                ExhaustionPolicy::Recycle => {
                    self.passes[i] += 1;
                    debug!(source = %self.sources[i].id(), pass = self.passes[i], "Recycling source");
                    self.sources[i].restart(self.passes[i])?;
                    match self.sources[i].next_example() {
                        Some(item) => return self.record_draw(i, item),
                        None => {
                            warn!(source = %self.sources[i].id(), "Source is empty; removing it from the pool");
                            self.active[i] = false;
                        }
                    }
                }
            }
        }
    }

    fn next_sequential(&mut self) -> DistillResult<RawExample> {
        while self.cursor < self.sources.len() {
            if let Some(item) = self.sources[self.cursor].next_example() {
                let i = self.cursor;
                return self.record_draw(i, item);
            }
            self.active[self.cursor] = false;
            self.cursor += 1;
        }
        Err(DistillError::SourceExhausted { drawn: self.drawn })
    }

    fn record_draw(&mut self, i: usize, item: DistillResult<RawExample>) -> DistillResult<RawExample> {
        self.drawn += 1;
        self.drawn_per_source[i] += 1;
        item
    }

    /// Start a new epoch: every source restarts and rejoins the pool.
    pub fn restart(&mut self, epoch: u64) -> DistillResult<()> {
        for (i, src) in self.sources.iter_mut().enumerate() {
            self.passes[i] = epoch;
            src.restart(epoch)?;
        }
        self.active.iter_mut().for_each(|a| *a = true);
        self.cursor = 0;
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
        Ok(())
    }

    /// Total draws so far, malformed records included.
    pub fn drawn(&self) -> u64 {
        self.drawn
    }

    /// Draws per source, in source order.
    pub fn drawn_per_source(&self) -> Vec<(String, u64)> {
        self.sources
            .iter()
            .zip(&self.drawn_per_source)
            .map(|(s, n)| (s.id().to_string(), *n))
            .collect()
    }
}

impl Iterator for WeightedMixer {
    type Item = DistillResult<RawExample>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_example() {
            Err(DistillError::SourceExhausted { .. }) => None,
            other => Some(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FeatureData, MaterializedSource};

    fn examples(id: &str, n: usize) -> Vec<RawExample> {
        (0..n)
            .map(|i| RawExample {
                features: FeatureData::Inline { n_mels: 1, frames: 1, values: vec![0.0] },
                reference: Some(format!("{id} {i}")),
                pseudo_label: None,
                prev_text: None,
                source_id: id.to_string(),
                index: i as u64,
            })
            .collect()
    }

    fn source(id: &str, n: usize) -> Box<dyn ExampleSource> {
        Box::new(MaterializedSource::from_examples(id, examples(id, n), true, 0))
    }

    #[test]
    fn proportions_converge_to_weights() {
        let mut mixer = WeightedMixer::new(
            vec![source("a", 50), source("b", 7)],
            vec![3.0, 1.0],
            MixOrder::Weighted,
            ExhaustionPolicy::Recycle,
            42,
        )
        .unwrap();

        let draws = 8000;
        let a = (0..draws)
            .filter(|_| mixer.next_example().unwrap().source_id == "a")
            .count();
        let frac = a as f64 / draws as f64;
        assert!((frac - 0.75).abs() < 0.03, "fraction of a = {frac}");
        assert_eq!(mixer.drawn(), draws as u64);
    }

    #[test]
    fn exhaust_policy_drains_every_source_once() {
        let mut mixer = WeightedMixer::new(
            vec![source("a", 10), source("b", 5)],
            vec![10.0, 5.0],
            MixOrder::Weighted,
            ExhaustionPolicy::Exhaust,
            1,
        )
        .unwrap();

        let all: Vec<_> = mixer.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 15);
        assert_eq!(all.iter().filter(|e| e.source_id == "b").count(), 5);
        assert!(matches!(mixer.next_example(), Err(DistillError::SourceExhausted { drawn: 15 })));

        mixer.restart(1).unwrap();
        assert_eq!(mixer.count(), 15);
    }

    #[test]
    fn recycle_policy_never_ends() {
        let mut mixer = WeightedMixer::new(
            vec![source("a", 2)],
            vec![1.0],
            MixOrder::Weighted,
            ExhaustionPolicy::Recycle,
            1,
        )
        .unwrap();
        for _ in 0..11 {
            mixer.next_example().unwrap();
        }
    }

    #[test]
    fn empty_source_is_dropped_under_recycle() {
        let mut mixer = WeightedMixer::new(
            vec![source("a", 0), source("b", 1)],
            vec![1.0, 1.0],
            MixOrder::Weighted,
            ExhaustionPolicy::Recycle,
            5,
        )
        .unwrap();
        for _ in 0..10 {
            assert_eq!(mixer.next_example().unwrap().source_id, "b");
        }
    }

    #[test]
    fn sequential_order_concatenates_sources() {
        let a = Box::new(MaterializedSource::from_examples("a", examples("a", 2), false, 0));
        let b = Box::new(MaterializedSource::from_examples("b", examples("b", 3), false, 0));
        let mixer = WeightedMixer::new(vec![a, b], vec![1.0, 1.0], MixOrder::Sequential, ExhaustionPolicy::Exhaust, 0)
            .unwrap();
        let refs: Vec<String> = mixer.map(|r| r.unwrap().reference.unwrap()).collect();
        assert_eq!(refs, vec!["a 0", "a 1", "b 0", "b 1", "b 2"]);
    }

    #[test]
    fn rejects_mismatched_weights() {
        let err = WeightedMixer::new(vec![source("a", 1)], vec![1.0, 2.0], MixOrder::Weighted, ExhaustionPolicy::Recycle, 0)
            .err()
            .unwrap();
        assert!(matches!(err, DistillError::ConfigMismatch { .. }));
    }

    #[test]
    fn same_seed_same_order() {
        let run = || {
            let m = WeightedMixer::new(
                vec![source("a", 5), source("b", 5)],
                vec![1.0, 2.0],
                MixOrder::Weighted,
                ExhaustionPolicy::Exhaust,
                7,
            )
            .unwrap();
            m.map(|r| r.unwrap().reference.unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
