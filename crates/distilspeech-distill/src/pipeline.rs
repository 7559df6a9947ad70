//! The data pipeline: mixer → preprocessor → WER filter → collator.
//!
//! [`DataPipeline`] pulls raw examples from the [`WeightedMixer`], tokenises
//! them, drops pseudo-labels the [`WerFilter`] rejects and groups the rest
//! into [`Batch`]es. Epoch boundaries are handled internally: when every
//! source is exhausted the short tail batch is emitted (or dropped, when
//! configured) and the next epoch starts until `max_epochs` is reached.
//!
//! [`Prefetcher`] runs a pipeline on a background thread and hands batches
//! over a bounded channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use distilspeech_core::{SpecialTokens, TextNormalizer, TextTokenizer};

use crate::collate::{Batch, Collator};
use crate::config::DistillConfig;
use crate::descriptor;
use crate::error::{DistillError, DistillResult};
use crate::mixer::{ExhaustionPolicy, MixOrder, WeightedMixer};
use crate::preprocess::{PreprocessConfig, Preprocessor};
use crate::source::{open_source, ExampleSource, PseudoLabel, RawExample};
use crate::wer::{FilterStats, WerFilter};

/// Draws needed before the skip rate is judged.
const MIN_DRAWS_FOR_SKIP_RATE: u64 = 50;

/// Log-mel padding value (silence after Whisper's feature normalisation).
const FEATURE_PAD_VALUE: f32 = 0.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub epoch: u64,
    /// Draws from the mixer, malformed records included.
    pub drawn: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub batches: u64,
    pub partial_batches: u64,
    pub batched_examples: u64,
    pub dropped_partial_examples: u64,
    pub filter: FilterStats,
}

impl PipelineStats {
    /// Fraction of draws that never reached a batch.
    pub fn skip_rate(&self) -> f64 {
        if self.drawn == 0 {
            0.0
        } else {
            (self.malformed + self.filtered) as f64 / self.drawn as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub drop_last_partial: bool,
    /// `None` runs epochs until the consumer stops pulling.
    pub max_epochs: Option<u64>,
    pub max_skip_rate: f64,
    /// Seed the preprocessor is restarted with by [`DataPipeline::reset`].
    pub seed: u64,
}

pub struct DataPipeline {
    mixer: WeightedMixer,
    preprocessor: Preprocessor,
    filter: Option<WerFilter>,
    collator: Collator,
    options: PipelineOptions,
    stats: PipelineStats,
    draws: u64,
    finished: bool,
    skip_warned: bool,
}

impl DataPipeline {
    /// `filter` is `None` when training on ground-truth transcripts.
    pub fn new(
        mixer: WeightedMixer,
        preprocessor: Preprocessor,
        filter: Option<WerFilter>,
        options: PipelineOptions,
    ) -> Self {
        let collator = Collator::new(options.batch_size, preprocessor.special_tokens().pad(), FEATURE_PAD_VALUE);
        Self {
            mixer,
            preprocessor,
            filter,
            collator,
            options,
            stats: PipelineStats::default(),
            draws: 0,
            finished: false,
            skip_warned: false,
        }
    }

    /// Next batch, or `None` once the last epoch is done.
    pub fn next_batch(&mut self) -> DistillResult<Option<Batch>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            match self.mixer.next_example() {
                Ok(raw) => {
                    self.count_draw();
                    if let Some(batch) = self.process(raw)? {
                        return Ok(Some(batch));
                    }
                }
                Err(DistillError::SourceExhausted { drawn }) => {
                    debug!(epoch = self.stats.epoch, drawn, "Epoch data exhausted");
                    let tail = self.flush_tail()?;
                    self.end_epoch()?;
                    if let Some(batch) = tail {
                        return Ok(Some(batch));
                    }
                }
                Err(e) if !e.is_fatal() => {
                    self.count_draw();
                    self.skip_malformed(&e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replay `draws` mixer draws without building batches, leaving the
    /// pipeline where a run that consumed them would be.
    ///
    /// Only the mixer and the preprocessor's random stream advance; the
    /// collator is assumed empty, which holds at every batch boundary.
    pub fn fast_forward(&mut self, draws: u64) -> DistillResult<()> {
        while self.draws < draws && !self.finished {
            match self.mixer.next_example() {
                Ok(_) => {
                    self.draws += 1;
                    self.preprocessor.skip_example();
                }
                Err(DistillError::SourceExhausted { .. }) => self.end_epoch()?,
                Err(e) if !e.is_fatal() => self.draws += 1,
                Err(e) => return Err(e),
            }
        }
        info!(draws = self.draws, epoch = self.stats.epoch, "Data pipeline fast-forwarded");
        Ok(())
    }

    /// Start over from epoch 0 with the initial seeds.
    pub fn reset(&mut self) -> DistillResult<()> {
        self.mixer.restart(0)?;
        self.preprocessor.reseed(self.options.seed);
        self.collator = Collator::new(
            self.options.batch_size,
            self.preprocessor.special_tokens().pad(),
            FEATURE_PAD_VALUE,
        );
        self.stats = PipelineStats::default();
        self.draws = 0;
        self.finished = false;
        self.skip_warned = false;
        Ok(())
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        if let Some(filter) = &self.filter {
            stats.filter = filter.stats().clone();
        }
        stats
    }

    /// Draws so far across all epochs.
    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn skip_rate_exceeded(&self) -> bool {
        self.stats.drawn >= MIN_DRAWS_FOR_SKIP_RATE && self.stats.skip_rate() > self.options.max_skip_rate
    }

    fn process(&mut self, raw: RawExample) -> DistillResult<Option<Batch>> {
        let example = match self.preprocessor.prepare(&raw) {
            Ok(example) => example,
            Err(e) if !e.is_fatal() => {
                self.skip_malformed(&e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Some(filter) = &mut self.filter {
            let decision = filter.evaluate(&example.source_id, example.reference.as_deref(), &example.label_text);
            if !decision.keep {
                self.stats.filtered += 1;
                self.check_skip_rate();
                return Ok(None);
            }
        }

        match self.collator.push(example) {
            Ok(Some(batch)) => Ok(Some(self.finish_batch(batch))),
            Ok(None) => Ok(None),
            Err(e) if !e.is_fatal() => {
                self.skip_malformed(&e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn flush_tail(&mut self) -> DistillResult<Option<Batch>> {
        let Some(batch) = self.collator.flush()? else {
            return Ok(None);
        };
        if self.options.drop_last_partial {
            warn!(
                epoch = self.stats.epoch,
                examples = batch.batch_size,
                "Dropping partial batch at end of epoch"
            );
            self.stats.dropped_partial_examples += batch.batch_size as u64;
            return Ok(None);
        }
        Ok(Some(self.finish_batch(batch)))
    }

    fn finish_batch(&mut self, mut batch: Batch) -> Batch {
        batch.epoch = self.stats.epoch;
        batch.drawn_through = self.draws;
        self.stats.batches += 1;
        self.stats.batched_examples += batch.batch_size as u64;
        if batch.partial {
            self.stats.partial_batches += 1;
        }
        batch
    }

    fn end_epoch(&mut self) -> DistillResult<()> {
        let next = self.stats.epoch + 1;
        if self.options.max_epochs.is_some_and(|max| next >= max) {
            info!(epochs = next, draws = self.draws, "All epochs consumed");
            self.finished = true;
            return Ok(());
        }
        info!(epoch = next, "Starting epoch");
        self.mixer.restart(next)?;
        self.stats.epoch = next;
        Ok(())
    }

    fn count_draw(&mut self) {
        self.draws += 1;
        self.stats.drawn += 1;
    }

    fn skip_malformed(&mut self, err: &DistillError) {
        self.stats.malformed += 1;
        warn!(error = %err, "Skipping example");
        self.check_skip_rate();
    }

    fn check_skip_rate(&mut self) {
        if !self.skip_warned && self.skip_rate_exceeded() {
            self.skip_warned = true;
            warn!(
                skip_rate = format!("{:.3}", self.stats.skip_rate()),
                max_skip_rate = self.options.max_skip_rate,
                malformed = self.stats.malformed,
                filtered = self.stats.filtered,
                "Skip rate above bound; check the data or the filter threshold"
            );
        }
    }
}

// ── Batch streams ─────────────────────────────────────────────────────────────

/// Where the trainer pulls batches from.
pub trait BatchStream: Send {
    fn next_batch(&mut self) -> DistillResult<Option<Batch>>;

    fn stats(&self) -> PipelineStats;

    fn skip_rate_exceeded(&self) -> bool;
}

impl BatchStream for DataPipeline {
    fn next_batch(&mut self) -> DistillResult<Option<Batch>> {
        DataPipeline::next_batch(self)
    }

    fn stats(&self) -> PipelineStats {
        DataPipeline::stats(self)
    }

    fn skip_rate_exceeded(&self) -> bool {
        DataPipeline::skip_rate_exceeded(self)
    }
}

/// Runs a [`DataPipeline`] on a background thread, keeping up to `depth`
/// batches ready. Statistics reflect the producer, which runs ahead of the
/// consumer by at most `depth` batches.
pub struct Prefetcher {
    rx: Option<Receiver<DistillResult<Batch>>>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<(PipelineStats, bool)>>,
}

impl Prefetcher {
    pub fn spawn(mut pipeline: DataPipeline, depth: usize) -> DistillResult<Self> {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new((pipeline.stats(), pipeline.skip_rate_exceeded())));

        let stop_flag = Arc::clone(&stop);
        let shared = Arc::clone(&stats);
        let handle = thread::Builder::new().name("distill-prefetch".into()).spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                let item = pipeline.next_batch();
                if let Ok(mut s) = shared.lock() {
                    *s = (pipeline.stats(), pipeline.skip_rate_exceeded());
                }
                match item {
                    Ok(Some(batch)) => {
                        if tx.send(Ok(batch)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
            debug!("Prefetch worker finished");
        })?;

        Ok(Self { rx: Some(rx), handle: Some(handle), stop, stats })
    }

    fn join(&mut self) -> DistillResult<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| DistillError::PipelineClosed("prefetch worker panicked".into()))?;
        }
        Ok(())
    }
}

impl BatchStream for Prefetcher {
    fn next_batch(&mut self) -> DistillResult<Option<Batch>> {
        let Some(rx) = &self.rx else {
            return Ok(None);
        };
        match rx.recv() {
            Ok(item) => item.map(Some),
            Err(_) => {
                self.rx = None;
                self.join()?;
                Ok(None)
            }
        }
    }

    fn stats(&self) -> PipelineStats {
        self.stats.lock().map(|s| s.0.clone()).unwrap_or_default()
    }

    fn skip_rate_exceeded(&self) -> bool {
        self.stats.lock().map(|s| s.1).unwrap_or(false)
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // dropping the receiver unblocks a producer waiting on a full channel
        self.rx = None;
        if let Err(e) = self.join() {
            warn!(error = %e, "Prefetch worker did not shut down cleanly");
        }
    }
}

// ── Builders ──────────────────────────────────────────────────────────────────

/// Collaborators shared by the training and evaluation pipelines.
#[derive(Clone)]
pub struct PipelineContext {
    pub tokenizer: Arc<dyn TextTokenizer>,
    pub special: SpecialTokens,
    pub normalizer: Arc<dyn TextNormalizer>,
}

/// Training pipeline for worker `rank`.
///
/// Each rank samples an independent stream: every seed is offset by the
/// rank, so workers see different shuffles of the same sources.
pub fn build_train_pipeline(
    config: &DistillConfig,
    ctx: &PipelineContext,
    rank: usize,
) -> DistillResult<DataPipeline> {
    let data = &config.data;
    let seed = data.seed.wrapping_add(rank as u64 * 1_000_003);
    let descriptors = descriptor::resolve(&data.train_spec(), "train")?;
    let columns = data.columns();

    let mut sources: Vec<Box<dyn ExampleSource>> = Vec::with_capacity(descriptors.len());
    for (i, d) in descriptors.iter().enumerate() {
        sources.push(open_source(
            d,
            &columns,
            data.streaming,
            true,
            data.shuffle_buffer_size,
            seed.wrapping_add(i as u64 + 1),
        )?);
    }
    let weights = descriptors.iter().map(|d| d.weight).collect();
    let mixer = WeightedMixer::new(sources, weights, MixOrder::Weighted, data.exhaustion_policy, seed)?;
    let preprocessor = Preprocessor::new(config.preprocess.clone(), Arc::clone(&ctx.tokenizer), ctx.special, seed);
    let filter = config
        .preprocess
        .use_pseudo_labels
        .then(|| WerFilter::new(config.filter.clone(), Arc::clone(&ctx.normalizer)));

    info!(
        rank,
        sources = descriptors.len(),
        streaming = data.streaming,
        policy = ?data.exhaustion_policy,
        filtering = filter.is_some(),
        "Training pipeline ready"
    );

    Ok(DataPipeline::new(
        mixer,
        preprocessor,
        filter,
        PipelineOptions {
            batch_size: config.training.per_device_batch_size,
            drop_last_partial: data.drop_last_partial,
            max_epochs: config.training.num_train_epochs,
            max_skip_rate: data.max_skip_rate,
            seed,
        },
    ))
}

/// Evaluation pipeline: sources read in order, one pass, no filtering, no
/// timestamp or previous-context sampling.
pub fn build_eval_pipeline(config: &DistillConfig, ctx: &PipelineContext) -> DistillResult<Option<DataPipeline>> {
    let data = &config.data;
    let Some(spec) = data.eval_spec() else {
        return Ok(None);
    };
    let descriptors = descriptor::resolve(&spec, "validation")?;
    let columns = data.columns();

    let mut sources: Vec<Box<dyn ExampleSource>> = Vec::with_capacity(descriptors.len());
    for d in &descriptors {
        sources.push(open_source(d, &columns, data.streaming, false, 1, data.seed)?);
    }
    let weights = vec![1.0; sources.len()];
    let mixer = WeightedMixer::new(sources, weights, MixOrder::Sequential, ExhaustionPolicy::Exhaust, data.seed)?;

    let preprocess = PreprocessConfig {
        timestamp_probability: 0.0,
        condition_on_prev_probability: 0.0,
        ..config.preprocess.clone()
    };
    let preprocessor = Preprocessor::new(preprocess, Arc::clone(&ctx.tokenizer), ctx.special, data.seed);

    info!(sources = descriptors.len(), "Evaluation pipeline ready");
    Ok(Some(DataPipeline::new(
        mixer,
        preprocessor,
        None,
        PipelineOptions {
            batch_size: config.training.per_device_batch_size,
            drop_last_partial: false,
            max_epochs: Some(1),
            max_skip_rate: 1.0,
            seed: data.seed,
        },
    )))
}

// ── Offline filter audit ──────────────────────────────────────────────────────

/// Result of running the pseudo-label filter over the training sources once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterAudit {
    pub stats: FilterStats,
    pub malformed: u64,
    /// Records without any pseudo-label; they are never filtered.
    pub unlabeled: u64,
}

/// Read every training source once, in file order, and count what the WER
/// filter would keep.
pub fn audit_train_sources(config: &DistillConfig, ctx: &PipelineContext) -> DistillResult<FilterAudit> {
    let data = &config.data;
    let descriptors = descriptor::resolve(&data.train_spec(), "train")?;
    let columns = data.columns();
    let mut filter = WerFilter::new(config.filter.clone(), Arc::clone(&ctx.normalizer));
    let mut audit = FilterAudit::default();

    for d in &descriptors {
        let mut source = open_source(d, &columns, data.streaming, false, 1, data.seed)?;
        while let Some(next) = source.next_example() {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) if !e.is_fatal() => {
                    debug!(source = %d.id(), error = %e, "Skipping malformed record");
                    audit.malformed += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let label = match &raw.pseudo_label {
                Some(PseudoLabel::Text(text)) => text.clone(),
                Some(PseudoLabel::Ids(ids)) => ctx.tokenizer.decode(ids, true)?,
                None => {
                    audit.unlabeled += 1;
                    continue;
                }
            };
            filter.evaluate(&raw.source_id, raw.reference.as_deref(), &label);
        }
        info!(source = %d.id(), "Source audited");
    }

    audit.stats = filter.stats().clone();
    Ok(audit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{record, special_tokens, write_jsonl, WordTokenizer, WORDS};
    use crate::wer::FilterConfig;
    use distilspeech_core::BasicTextNormalizer;
    use tempfile::TempDir;

    fn context() -> PipelineContext {
        let tokenizer: Arc<dyn TextTokenizer> = Arc::new(WordTokenizer::new(WORDS));
        let special = special_tokens(tokenizer.as_ref());
        PipelineContext { tokenizer, special, normalizer: Arc::new(BasicTextNormalizer) }
    }

    /// Two sources: `clean` (pseudo-label matches the reference) and `noisy`
    /// (every second pseudo-label is wrong).
    fn datasets(dir: &std::path::Path, n: usize) -> DistillConfig {
        let clean: Vec<_> = (0..n).map(|_| record(2, 3, "the cat sat", "the cat sat")).collect();
        let noisy: Vec<_> = (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    record(2, 3, "a big dog", "a big dog")
                } else {
                    record(2, 3, "a big dog", "red mat far away")
                }
            })
            .collect();
        write_jsonl(&dir.join("clean"), "train-0.jsonl", &clean);
        write_jsonl(&dir.join("noisy"), "train-0.jsonl", &noisy);

        let mut config = DistillConfig::default();
        config.data.train_dataset_name =
            format!("{}+{}", dir.join("clean").display(), dir.join("noisy").display());
        config.data.exhaustion_policy = ExhaustionPolicy::Exhaust;
        config.training.per_device_batch_size = 4;
        config.training.num_train_epochs = Some(1);
        config.filter = FilterConfig { wer_threshold: 10.0, ..Default::default() };
        config
    }

    fn drain(p: &mut dyn BatchStream) -> Vec<Batch> {
        let mut out = Vec::new();
        while let Some(b) = p.next_batch().unwrap() {
            out.push(b);
        }
        out
    }

    #[test]
    fn filter_drops_bad_pseudo_labels_and_tail_is_kept() {
        let dir = TempDir::new().unwrap();
        let config = datasets(dir.path(), 6);
        let mut p = build_train_pipeline(&config, &context(), 0).unwrap();
        let batches = drain(&mut p);

        let stats = p.stats();
        assert_eq!(stats.drawn, 12);
        assert_eq!(stats.filtered, 3);
        assert_eq!(stats.batched_examples, 9);
        assert_eq!(batches.iter().map(|b| b.batch_size).sum::<usize>(), 9);
        assert_eq!(batches.len(), 3);
        assert!(batches.last().unwrap().partial);
        assert_eq!(stats.filter.rejected_wer, 3);
        assert_eq!(batches.last().unwrap().drawn_through, 12);
    }

    #[test]
    fn drop_last_partial_is_counted() {
        let dir = TempDir::new().unwrap();
        let mut config = datasets(dir.path(), 6);
        config.data.drop_last_partial = true;
        let mut p = build_train_pipeline(&config, &context(), 0).unwrap();
        let batches = drain(&mut p);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| !b.partial));
        assert_eq!(p.stats().dropped_partial_examples, 1);
    }

    #[test]
    fn epochs_advance_until_limit() {
        let dir = TempDir::new().unwrap();
        let mut config = datasets(dir.path(), 4);
        config.training.num_train_epochs = Some(2);
        let mut p = build_train_pipeline(&config, &context(), 0).unwrap();
        let batches = drain(&mut p);
        assert_eq!(batches.first().unwrap().epoch, 0);
        assert_eq!(batches.last().unwrap().epoch, 1);
        assert_eq!(p.stats().drawn, 16);
    }

    #[test]
    fn fast_forward_matches_uninterrupted_run() {
        let dir = TempDir::new().unwrap();
        let mut config = datasets(dir.path(), 8);
        config.preprocess.timestamp_probability = 0.5;
        config.training.num_train_epochs = Some(2);
        let ctx = context();

        let mut full = build_train_pipeline(&config, &ctx, 0).unwrap();
        let all = drain(&mut full);
        assert!(all.len() > 3);

        let mut resumed = build_train_pipeline(&config, &ctx, 0).unwrap();
        resumed.fast_forward(all[1].drawn_through).unwrap();
        let rest = drain(&mut resumed);
        assert_eq!(rest.len(), all.len() - 2);
        for (a, b) in all[2..].iter().zip(&rest) {
            assert_eq!(a.labels, b.labels);
            assert_eq!(a.decoder_input_ids, b.decoder_input_ids);
            assert_eq!(a.epoch, b.epoch);
        }
    }

    #[test]
    fn ranks_sample_different_orders() {
        let dir = TempDir::new().unwrap();
        let config = datasets(dir.path(), 8);
        let ctx = context();
        let a = drain(&mut build_train_pipeline(&config, &ctx, 0).unwrap());
        let b = drain(&mut build_train_pipeline(&config, &ctx, 1).unwrap());
        let order = |bs: &[Batch]| bs.iter().flat_map(|b| b.source_ids.clone()).collect::<Vec<_>>();
        assert_ne!(order(&a), order(&b));
    }

    #[test]
    fn eval_pipeline_is_sequential_and_resettable() {
        let dir = TempDir::new().unwrap();
        let mut config = datasets(dir.path(), 3);
        config.data.eval_dataset_name = Some(config.data.train_dataset_name.clone());
        config.data.eval_split_name = Some("train+train".into());
        let mut p = build_eval_pipeline(&config, &context()).unwrap().unwrap();

        let first = drain(&mut p);
        let ids: Vec<String> = first.iter().flat_map(|b| b.source_ids.clone()).collect();
        assert_eq!(ids.len(), 6, "no filtering during evaluation");
        assert!(ids[..3].iter().all(|s| s.contains("clean")));

        p.reset().unwrap();
        let second = drain(&mut p);
        assert_eq!(first, second);
    }

    #[test]
    fn prefetcher_delivers_same_batches() {
        let dir = TempDir::new().unwrap();
        let config = datasets(dir.path(), 6);
        let ctx = context();
        let direct = drain(&mut build_train_pipeline(&config, &ctx, 0).unwrap());
        let mut pre = Prefetcher::spawn(build_train_pipeline(&config, &ctx, 0).unwrap(), 2).unwrap();
        let prefetched = drain(&mut pre);
        assert_eq!(direct, prefetched);
        assert_eq!(pre.stats().filtered, 3);
        assert!(pre.next_batch().unwrap().is_none());
    }

    #[test]
    fn dropping_prefetcher_early_stops_worker() {
        let dir = TempDir::new().unwrap();
        let mut config = datasets(dir.path(), 6);
        config.data.exhaustion_policy = ExhaustionPolicy::Recycle;
        config.training.num_train_epochs = None;
        let mut pre = Prefetcher::spawn(build_train_pipeline(&config, &context(), 0).unwrap(), 1).unwrap();
        assert!(pre.next_batch().unwrap().is_some());
        drop(pre);
    }

    #[test]
    fn audit_counts_kept_and_rejected_per_source() {
        let dir = TempDir::new().unwrap();
        let config = datasets(dir.path(), 6);
        let audit = audit_train_sources(&config, &context()).unwrap();

        assert_eq!(audit.stats.evaluated, 12);
        assert_eq!(audit.stats.kept, 9);
        assert_eq!(audit.stats.rejected_wer, 3);
        assert_eq!(audit.malformed, 0);
        let noisy = format!("{}/default/train", dir.path().join("noisy").display());
        assert_eq!(audit.stats.per_source.get(&noisy), Some(&(3, 3)));
    }
}
