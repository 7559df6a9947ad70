//! Word error rate and the pseudo-label quality filter.
//!
//! A pseudo-label is kept when its WER against the ground-truth reference,
//! after both are run through the same [`TextNormalizer`], is at most the
//! configured threshold.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use distilspeech_core::TextNormalizer;

use crate::error::DistillError;

/// WER in percent: `(S + I + D) / max(1, |ref|) × 100` over
/// whitespace-separated words.
///
/// An empty reference scores 0 against an empty hypothesis and 100 against
/// anything else.
pub fn word_error_rate(reference: &str, hypothesis: &str) -> f64 {
    let ref_words: Vec<&str> = reference.split_whitespace().collect();
    let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();

    if ref_words.is_empty() {
        return if hyp_words.is_empty() { 0.0 } else { 100.0 };
    }

    let distance = levenshtein_distance(&ref_words, &hyp_words);
    distance as f64 / ref_words.len() as f64 * 100.0
}

/// Word edit distance and reference length, for corpus-level WER
/// (`sum(errors) / sum(words)`).
pub fn word_errors(reference: &str, hypothesis: &str) -> (usize, usize) {
    let ref_words: Vec<&str> = reference.split_whitespace().collect();
    let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();
    (levenshtein_distance(&ref_words, &hyp_words), ref_words.len())
}

/// Edit distance between two sequences, two rows at a time.
fn levenshtein_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, a_item) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, b_item) in b.iter().enumerate() {
            let cost = usize::from(a_item != b_item);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

// ── Filter ────────────────────────────────────────────────────────────────────

/// What to do with an example that has a pseudo-label but no reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReferencePolicy {
    /// Keep the example unfiltered (counted as uncomparable).
    #[default]
    Accept,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Maximum WER (percent) for a pseudo-label to be kept.
    pub wer_threshold: f64,
    /// Reject pseudo-labels written entirely in upper case.
    pub reject_uppercase: bool,
    pub missing_reference: MissingReferencePolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            wer_threshold: 10.0,
            reject_uppercase: true,
            missing_reference: MissingReferencePolicy::Accept,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    WithinThreshold,
    AboveThreshold,
    Uppercase,
    MissingReference,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterDecision {
    pub keep: bool,
    /// `None` when no reference was available.
    pub wer: Option<f64>,
    pub reason: FilterReason,
}

/// Running counts of filter outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStats {
    pub evaluated: u64,
    pub kept: u64,
    pub rejected_wer: u64,
    pub rejected_uppercase: u64,
    pub uncomparable: u64,
    /// `source id → (kept, rejected)`.
    pub per_source: BTreeMap<String, (u64, u64)>,
}

impl FilterStats {
    pub fn rejected(&self) -> u64 {
        self.evaluated - self.kept
    }

    pub fn keep_rate(&self) -> f64 {
        if self.evaluated == 0 {
            1.0
        } else {
            self.kept as f64 / self.evaluated as f64
        }
    }
}

pub struct WerFilter {
    config: FilterConfig,
    normalizer: Arc<dyn TextNormalizer>,
    stats: FilterStats,
    warned_sources: HashSet<String>,
}

impl WerFilter {
    pub fn new(config: FilterConfig, normalizer: Arc<dyn TextNormalizer>) -> Self {
        Self { config, normalizer, stats: FilterStats::default(), warned_sources: HashSet::new() }
    }

    /// Decide whether `pseudo_label` is good enough to train on.
    pub fn evaluate(&mut self, source_id: &str, reference: Option<&str>, pseudo_label: &str) -> FilterDecision {
        let decision = self.decide(source_id, reference, pseudo_label);

        self.stats.evaluated += 1;
        let entry = self.stats.per_source.entry(source_id.to_string()).or_default();
        if decision.keep {
            self.stats.kept += 1;
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        match decision.reason {
            FilterReason::AboveThreshold => self.stats.rejected_wer += 1,
            FilterReason::Uppercase => self.stats.rejected_uppercase += 1,
            FilterReason::MissingReference => self.stats.uncomparable += 1,
            FilterReason::WithinThreshold => {}
        }
        decision
    }

    fn decide(&mut self, source_id: &str, reference: Option<&str>, pseudo_label: &str) -> FilterDecision {
        if self.config.reject_uppercase && is_all_uppercase(pseudo_label) {
            debug!(source = source_id, pseudo_label, "Rejecting upper-case pseudo-label");
            return FilterDecision { keep: false, wer: None, reason: FilterReason::Uppercase };
        }

        let Some(reference) = reference else {
            if self.warned_sources.insert(source_id.to_string()) {
                let err = DistillError::FilterUncomparable { source_id: source_id.to_string() };
                warn!(policy = ?self.config.missing_reference, "{err}");
            }
            let keep = self.config.missing_reference == MissingReferencePolicy::Accept;
            return FilterDecision { keep, wer: None, reason: FilterReason::MissingReference };
        };

        let wer = word_error_rate(&self.normalizer.normalize(reference), &self.normalizer.normalize(pseudo_label));
        let keep = wer <= self.config.wer_threshold;
        if !keep {
            debug!(source = source_id, wer, threshold = self.config.wer_threshold, "Pseudo-label rejected");
        }
        FilterDecision {
            keep,
            wer: Some(wer),
            reason: if keep { FilterReason::WithinThreshold } else { FilterReason::AboveThreshold },
        }
    }

    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }
}

/// True when the text has at least one letter and no lower-case letters.
fn is_all_uppercase(text: &str) -> bool {
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(|c| !c.is_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use distilspeech_core::BasicTextNormalizer;

    fn filter(config: FilterConfig) -> WerFilter {
        WerFilter::new(config, Arc::new(BasicTextNormalizer))
    }

    #[test]
    fn identical_is_zero() {
        assert_eq!(word_error_rate("the cat sat", "the cat sat"), 0.0);
    }

    #[test]
    fn empty_hypothesis_is_hundred() {
        assert_eq!(word_error_rate("the cat sat", ""), 100.0);
    }

    #[test]
    fn empty_reference() {
        assert_eq!(word_error_rate("", ""), 0.0);
        assert_eq!(word_error_rate("", "hello"), 100.0);
    }

    #[test]
    fn corpus_counts() {
        assert_eq!(word_errors("the cat sat", "the cat"), (1, 3));
        assert_eq!(word_errors("", "a b"), (2, 0));
    }

    #[test]
    fn one_substitution_in_three_words() {
        let wer = word_error_rate("the cat sat", "the cat sit");
        assert!((wer - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn insertions_can_exceed_hundred() {
        assert_eq!(word_error_rate("a", "a b c"), 200.0);
    }

    #[test]
    fn levenshtein_basic() {
        assert_eq!(levenshtein_distance(&["a", "b", "c"], &["a", "c"]), 1);
        assert_eq!(levenshtein_distance::<&str>(&[], &["x", "y"]), 2);
        assert_eq!(levenshtein_distance(&["k", "i", "t"], &["s", "i", "t", "s"]), 2);
    }

    #[test]
    fn threshold_decides() {
        let mut strict = filter(FilterConfig { wer_threshold: 10.0, ..Default::default() });
        let d = strict.evaluate("ls", Some("the cat sat"), "the cat sit");
        assert!(!d.keep);
        assert_eq!(d.reason, FilterReason::AboveThreshold);

        let mut loose = filter(FilterConfig { wer_threshold: 40.0, ..Default::default() });
        assert!(loose.evaluate("ls", Some("the cat sat"), "the cat sit").keep);
    }

    #[test]
    fn normalisation_applied_to_both_sides() {
        let mut f = filter(FilterConfig::default());
        let d = f.evaluate("ls", Some("The cat, sat."), "the cat sat");
        assert!(d.keep);
        assert_eq!(d.wer, Some(0.0));
    }

    #[test]
    fn uppercase_pseudo_labels_rejected() {
        let mut f = filter(FilterConfig::default());
        let d = f.evaluate("ls", Some("the cat sat"), "THE CAT SAT");
        assert!(!d.keep);
        assert_eq!(d.reason, FilterReason::Uppercase);

        let mut lenient = filter(FilterConfig { reject_uppercase: false, ..Default::default() });
        assert!(lenient.evaluate("ls", Some("the cat sat"), "THE CAT SAT").keep);
        assert!(!is_all_uppercase("123 ?"));
        assert!(!is_all_uppercase("Hello"));
    }

    #[test]
    fn missing_reference_policy() {
        let mut accept = filter(FilterConfig::default());
        let d = accept.evaluate("cv", None, "anything");
        assert!(d.keep);
        assert_eq!(d.wer, None);
        assert_eq!(accept.stats().uncomparable, 1);

        let mut reject = filter(FilterConfig {
            missing_reference: MissingReferencePolicy::Reject,
            ..Default::default()
        });
        assert!(!reject.evaluate("cv", None, "anything").keep);
    }

    #[test]
    fn stats_accumulate_per_source() {
        let mut f = filter(FilterConfig::default());
        f.evaluate("a", Some("x y"), "x y");
        f.evaluate("a", Some("x y"), "z w");
        f.evaluate("b", Some("x"), "x");
        let s = f.stats();
        assert_eq!(s.evaluated, 3);
        assert_eq!(s.kept, 2);
        assert_eq!(s.rejected(), 1);
        assert_eq!(s.rejected_wer, 1);
        assert_eq!(s.per_source["a"], (1, 1));
        assert_eq!(s.per_source["b"], (1, 0));
        assert!((s.keep_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}
