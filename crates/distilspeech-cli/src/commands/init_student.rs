//! `distilspeech init-student`: derive a shallow-decoder student from a
//! teacher checkpoint.
//!
//! ```text
//! distilspeech init-student --teacher ./whisper-large-v3 --out ./student-2l --decoder-layers 2
//! ```

use std::path::Path;

use anyhow::{Context, Result};

use distilspeech_distill::init_student_from_teacher;

use crate::config::expand_path;

pub fn run(teacher: &str, out: &Path, decoder_layers: usize) -> Result<()> {
    let teacher_dir = expand_path(teacher);
    let init = init_student_from_teacher(&teacher_dir, out, decoder_layers)
        .with_context(|| format!("Failed to initialise a student from {}", teacher_dir.display()))?;

    println!(
        "\nStudent ready: {}\n\
         Decoder layers: {} of {} (teacher layers {:?})\n\
         Tensors: {}\n\
         \n\
         Train it with:\n  distilspeech train --teacher {} --student {}",
        init.out_dir.display(),
        init.kept_layers.len(),
        init.teacher_decoder_layers,
        init.kept_layers,
        init.tensors,
        teacher_dir.display(),
        init.out_dir.display(),
    );
    Ok(())
}
