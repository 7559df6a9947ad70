//! `distilspeech filter`: dry-run the pseudo-label WER filter over the
//! configured training sources, without loading any model.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use distilspeech_core::{BasicTextNormalizer, SpecialTokens, TextTokenizer, WhisperTokenizer};
use distilspeech_distill::pipeline::{audit_train_sources, FilterAudit, PipelineContext};

use crate::config::{expand_path, AppConfig};

pub fn run(config: &AppConfig, tokenizer: Option<&str>, json: bool) -> Result<()> {
    let tokenizer_dir = tokenizer
        .or(config.models.tokenizer.as_deref())
        .or(config.models.teacher.as_deref())
        .map(expand_path)
        .context("No tokenizer: pass --tokenizer or set models.tokenizer / models.teacher")?;

    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(
        WhisperTokenizer::from_model_dir(&tokenizer_dir)
            .with_context(|| format!("Failed to load tokenizer from {}", tokenizer_dir.display()))?,
    );
    let special = SpecialTokens::resolve(tokenizer.as_ref(), config.distill.preprocess.language.as_deref())
        .context("Tokenizer is missing Whisper control tokens")?;
    let ctx = PipelineContext { tokenizer, special, normalizer: Arc::new(BasicTextNormalizer) };

    info!(
        threshold = config.distill.filter.wer_threshold,
        sources = %config.distill.data.train_dataset_name,
        "Auditing pseudo-labels"
    );
    let audit = audit_train_sources(&config.distill, &ctx).context("Filter audit failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&audit)?);
    } else {
        print_report(&audit, config.distill.filter.wer_threshold);
    }
    Ok(())
}

fn print_report(audit: &FilterAudit, threshold: f64) {
    let stats = &audit.stats;
    println!("{:<60} {:>8} {:>8} {:>8}", "SOURCE", "KEPT", "REJECTED", "KEEP %");
    println!("{}", "-".repeat(88));
    for (source, (kept, rejected)) in &stats.per_source {
        let total = kept + rejected;
        let rate = if total == 0 { 100.0 } else { *kept as f64 * 100.0 / total as f64 };
        println!("{:<60} {:>8} {:>8} {:>7.1}%", source, kept, rejected, rate);
    }
    println!(
        "\nWER threshold {threshold:.1} %: kept {}/{} ({:.1} %)\n\
         Rejected: {} above threshold, {} upper-case\n\
         No reference: {}  Unlabelled: {}  Malformed: {}",
        stats.kept,
        stats.evaluated,
        stats.keep_rate() * 100.0,
        stats.rejected_wer,
        stats.rejected_uppercase,
        stats.uncomparable,
        audit.unlabeled,
        audit.malformed,
    );
}
