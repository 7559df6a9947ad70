//! Model export.
//!
//! Writes the trained student to a directory that loads like any other
//! HuggingFace Whisper checkpoint:
//!
//! ```text
//! <output_dir>/
//!   model.safetensors          trained weights
//!   config.json                copied from the student's source directory
//!   generation_config.json     (optional) copied alongside config.json
//!   preprocessor_config.json   (optional) feature extractor settings
//!   tokenizer.json             copied from the tokenizer directory
//!   ...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use distilspeech_core::Seq2SeqModel;

use crate::error::{DistillError, DistillResult};

const TOKENIZER_FILES: [&str; 8] = [
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "added_tokens.json",
    "normalizer.json",
    "vocab.json",
    "merges.txt",
    "tokenizer.model",
];

const METADATA_FILES: [&str; 2] = ["generation_config.json", "preprocessor_config.json"];

/// Export `student` to `output_dir`.
///
/// `student_dir` supplies `config.json`; `tokenizer_dir` supplies the
/// tokenizer artifacts. Returns the path of the written weights.
pub fn export(
    student: &dyn Seq2SeqModel,
    student_dir: &Path,
    tokenizer_dir: &Path,
    output_dir: &Path,
) -> DistillResult<PathBuf> {
    fs::create_dir_all(output_dir)?;

    let weights_path = output_dir.join("model.safetensors");
    student.save_weights(&weights_path)?;
    info!(path = %weights_path.display(), "Student weights saved");

    let config_src = student_dir.join("config.json");
    if !config_src.is_file() {
        return Err(DistillError::invalid(
            "student_dir",
            format!("{} not found", config_src.display()),
        ));
    }
    copy_file(&config_src, &output_dir.join("config.json"))?;
    copy_model_metadata(student_dir, output_dir)?;
    copy_tokenizer_files(tokenizer_dir, output_dir)?;

    info!(output_dir = %output_dir.display(), "Export complete");
    Ok(weights_path)
}

/// Copy the optional generation and feature-extractor configs.
pub(crate) fn copy_model_metadata(src_dir: &Path, dst_dir: &Path) -> DistillResult<usize> {
    copy_present(src_dir, dst_dir, &METADATA_FILES)
}

/// Copy tokenizer artifacts so the output can be loaded without the
/// teacher directory. Returns the number of files copied.
pub(crate) fn copy_tokenizer_files(src_dir: &Path, dst_dir: &Path) -> DistillResult<usize> {
    copy_present(src_dir, dst_dir, &TOKENIZER_FILES)
}

fn copy_present(src_dir: &Path, dst_dir: &Path, names: &[&str]) -> DistillResult<usize> {
    let mut copied = 0;
    for name in names {
        let src = src_dir.join(name);
        if src.is_file() {
            copy_file(&src, &dst_dir.join(name))?;
            info!(file = name, "Model file copied");
            copied += 1;
        }
    }
    Ok(copied)
}

// fs::copy onto itself truncates the file
fn copy_file(src: &Path, dst: &Path) -> DistillResult<()> {
    if same_file(src, dst) {
        return Ok(());
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
