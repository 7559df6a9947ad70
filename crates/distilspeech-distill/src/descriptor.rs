//! Dataset descriptor resolution.
//!
//! Multiple training sources are configured as `+`-joined lists, one list per
//! field:
//!
//! ```text
//! train_dataset_name        = "data/librispeech+data/common_voice"
//! train_dataset_config_name = "clean+en"
//! train_split_name          = "train.100+train"
//! text_column_name          = "text+sentence"
//! train_dataset_samples     = "100+50"
//! ```
//!
//! Every list that is given must have as many entries as the name list.
//! Omitted lists default to `default` (config), `train` (split), `text`
//! (column) and weight `1.0`.
//!
//! On disk a descriptor resolves to the JSONL files in `<source>/<config>/`
//! (or `<source>/` for config `default`) whose file name starts with the split
//! name, e.g. `data/librispeech/clean/train.100-00000.jsonl`. A source that
//! points directly at a `.jsonl` file is used as-is.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DistillError, DistillResult};

pub const DEFAULT_CONFIG: &str = "default";

/// The raw `+`-joined configuration fields for a set of sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub names: String,
    pub config_names: Option<String>,
    pub splits: Option<String>,
    pub text_columns: Option<String>,
    pub samples: Option<String>,
}

/// One resolved dataset source. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub source: String,
    pub config: String,
    pub split: String,
    pub text_column: String,
    /// Relative sampling weight (a sample count is used as a weight as-is).
    pub weight: f64,
}

impl DatasetDescriptor {
    /// Stable id used in logs, metrics and batches: `source/config/split`.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.source, self.config, self.split)
    }

    /// The directory holding this source's split files.
    pub fn dir(&self) -> PathBuf {
        let root = PathBuf::from(&self.source);
        if self.config == DEFAULT_CONFIG {
            root
        } else {
            root.join(&self.config)
        }
    }

    /// JSONL files backing this descriptor, in alphabetical order.
    pub fn files(&self) -> DistillResult<Vec<PathBuf>> {
        let source = Path::new(&self.source);
        if source.is_file() {
            return Ok(vec![source.to_path_buf()]);
        }

        let dir = self.dir();
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| DistillError::invalid("dataset", format!("cannot read {}: {e}", dir.display())))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let name = p.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                name.starts_with(&self.split) && name.ends_with(".jsonl")
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(DistillError::invalid(
                "dataset",
                format!("no `{}*.jsonl` files in {}", self.split, dir.display()),
            ));
        }
        Ok(files)
    }
}

/// Parse `spec` into an ordered list of descriptors.
///
/// `default_split` is used when `spec.splits` is omitted (`train` for
/// training sources, `validation` for evaluation sources).
pub fn resolve(spec: &DatasetSpec, default_split: &str) -> DistillResult<Vec<DatasetDescriptor>> {
    let names = split_list(&spec.names);
    if names.is_empty() {
        return Err(DistillError::invalid("dataset_name", "at least one dataset is required"));
    }
    let n = names.len();

    let configs = field_or_default(spec.config_names.as_deref(), "dataset_config_name", n, DEFAULT_CONFIG)?;
    let splits = field_or_default(spec.splits.as_deref(), "split_name", n, default_split)?;
    let columns = field_or_default(spec.text_columns.as_deref(), "text_column_name", n, "text")?;
    let weights = match spec.samples.as_deref() {
        Some(raw) => {
            let parts = checked_list(raw, "dataset_samples", n)?;
            parts.iter().map(|p| parse_weight(p)).collect::<DistillResult<Vec<_>>>()?
        }
        None => vec![1.0; n],
    };

    Ok(names
        .into_iter()
        .enumerate()
        .map(|(i, source)| DatasetDescriptor {
            source,
            config: configs[i].clone(),
            split: splits[i].clone(),
            text_column: columns[i].clone(),
            weight: weights[i],
        })
        .collect())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split('+')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn checked_list(raw: &str, field: &str, expected: usize) -> DistillResult<Vec<String>> {
    let parts = split_list(raw);
    if parts.len() != expected {
        return Err(DistillError::ConfigMismatch { field: field.to_string(), expected, got: parts.len() });
    }
    Ok(parts)
}

fn field_or_default(raw: Option<&str>, field: &str, n: usize, default: &str) -> DistillResult<Vec<String>> {
    match raw {
        Some(raw) => checked_list(raw, field, n),
        None => Ok(vec![default.to_string(); n]),
    }
}

fn parse_weight(raw: &str) -> DistillResult<f64> {
    let w: f64 = raw
        .parse()
        .map_err(|_| DistillError::invalid("dataset_samples", format!("'{raw}' is not a number")))?;
    if !w.is_finite() || w <= 0.0 {
        return Err(DistillError::invalid("dataset_samples", format!("weight must be positive, got {raw}")));
    }
    Ok(w)
}
