//! `distilspeech checkpoints`: list the checkpoints of a run.

use std::path::PathBuf;

use anyhow::{Context, Result};

use distilspeech_distill::checkpoint::{load_manifest, CheckpointStore};

use crate::config::AppConfig;

pub fn run(config: &AppConfig, output_dir: Option<&PathBuf>) -> Result<()> {
    let dir = output_dir.cloned().unwrap_or_else(|| config.distill.checkpoint.output_dir.clone());
    let store = CheckpointStore::new(&dir, None);
    let checkpoints = store
        .list()
        .with_context(|| format!("Cannot read {}", dir.display()))?;

    if checkpoints.is_empty() {
        println!("No checkpoints in {}.", dir.display());
        return Ok(());
    }

    println!(
        "{:<8} {:<6} {:<12} {:<10} {:<8} {:<26} {}",
        "STEP", "EPOCH", "LR", "LOSS", "WORKERS", "CREATED", "PATH"
    );
    println!("{}", "-".repeat(100));
    for (step, path) in &checkpoints {
        let m = load_manifest(path).with_context(|| format!("Cannot read manifest in {}", path.display()))?;
        let loss = m.last_loss.map(|l| format!("{l:.4}")).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<6} {:<12.3e} {:<10} {:<8} {:<26} {}",
            step,
            m.epoch,
            m.learning_rate,
            loss,
            m.world_size,
            m.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            path.display()
        );
    }
    println!("\n{} checkpoint(s) in {}", checkpoints.len(), dir.display());

    Ok(())
}
