//! Student initialisation from a teacher checkpoint.
//!
//! The student keeps the teacher's encoder and embeddings unchanged and a
//! subset of its decoder layers, chosen evenly spaced over the teacher's
//! depth so the first and last layers are always kept:
//!
//! | Teacher layers | Student layers | Kept |
//! |---|---|---|
//! | 32 | 2 | 0, 31 |
//! | 32 | 4 | 0, 10, 21, 31 |
//! | 4 | 1 | 3 |
//!
//! Decoder layer tensors are renumbered densely
//! (`model.decoder.layers.31.*` becomes `model.decoder.layers.1.*`) and
//! `config.json` is rewritten with the reduced `decoder_layers`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{safetensors, Device, Tensor};
use serde_json::Value;
use tracing::{debug, info};

use distilspeech_core::whisper::collect_safetensor_paths;

use crate::error::{DistillError, DistillResult};
use crate::export::{copy_model_metadata, copy_tokenizer_files};

const DECODER_LAYER_PREFIX: &str = "model.decoder.layers.";

/// What [`init_student_from_teacher`] produced.
#[derive(Debug, Clone)]
pub struct StudentInit {
    pub out_dir: PathBuf,
    pub teacher_decoder_layers: usize,
    /// Teacher layer index for each student layer.
    pub kept_layers: Vec<usize>,
    pub tensors: usize,
}

/// Teacher decoder layers kept for a student with `student_layers` layers.
pub fn select_decoder_layers(teacher_layers: usize, student_layers: usize) -> DistillResult<Vec<usize>> {
    if student_layers == 0 || student_layers > teacher_layers {
        return Err(DistillError::invalid(
            "decoder_layers",
            format!("must be in 1..={teacher_layers}, got {student_layers}"),
        ));
    }
    if student_layers == 1 {
        return Ok(vec![teacher_layers - 1]);
    }
    let span = (teacher_layers - 1) as f64;
    let steps = (student_layers - 1) as f64;
    Ok((0..student_layers).map(|i| (i as f64 * span / steps).round() as usize).collect())
}

/// Build a student checkpoint in `out_dir` from the teacher in `teacher_dir`.
pub fn init_student_from_teacher(
    teacher_dir: &Path,
    out_dir: &Path,
    decoder_layers: usize,
) -> DistillResult<StudentInit> {
    let config_path = teacher_dir.join("config.json");
    let mut config: Value = serde_json::from_str(&fs::read_to_string(&config_path).map_err(|e| {
        DistillError::invalid("teacher_dir", format!("cannot read {}: {e}", config_path.display()))
    })?)?;
    let teacher_layers = config
        .get("decoder_layers")
        .and_then(Value::as_u64)
        .ok_or_else(|| DistillError::invalid("teacher_dir", "config.json has no `decoder_layers`"))?
        as usize;

    let kept = select_decoder_layers(teacher_layers, decoder_layers)?;
    let renumber: HashMap<usize, usize> = kept.iter().enumerate().map(|(new, &old)| (old, new)).collect();
    info!(
        teacher = %teacher_dir.display(),
        teacher_layers,
        student_layers = decoder_layers,
        kept = ?kept,
        "Initialising student from teacher"
    );

    let mut student: HashMap<String, Tensor> = HashMap::new();
    for shard in collect_safetensor_paths(teacher_dir)? {
        for (name, tensor) in safetensors::load(&shard, &Device::Cpu)? {
            match rename_decoder_tensor(&name, &renumber) {
                Some(new_name) => {
                    student.insert(new_name, tensor);
                }
                None => debug!(tensor = %name, "Dropping decoder layer tensor"),
            }
        }
    }

    fs::create_dir_all(out_dir)?;
    let weights_path = out_dir.join("model.safetensors");
    safetensors::save(&student, &weights_path)?;
    info!(path = %weights_path.display(), tensors = student.len(), "Student weights written");

    config["decoder_layers"] = Value::from(decoder_layers);
    fs::write(out_dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;

    copy_model_metadata(teacher_dir, out_dir)?;
    copy_tokenizer_files(teacher_dir, out_dir)?;

    Ok(StudentInit {
        out_dir: out_dir.to_path_buf(),
        teacher_decoder_layers: teacher_layers,
        kept_layers: kept,
        tensors: student.len(),
    })
}

/// New name of `name` in the student, or `None` when its layer is dropped.
fn rename_decoder_tensor(name: &str, renumber: &HashMap<usize, usize>) -> Option<String> {
    let Some(rest) = name.strip_prefix(DECODER_LAYER_PREFIX) else {
        return Some(name.to_string());
    };
    let (index, suffix) = rest.split_once('.')?;
    let index: usize = index.parse().ok()?;
    renumber
        .get(&index)
        .map(|new| format!("{DECODER_LAYER_PREFIX}{new}.{suffix}"))
}
