//! Example sources backing a [`DatasetDescriptor`].
//!
//! Each line of a source JSONL file is one record:
//!
//! ```json
//! {"input_features": [[0.1, 0.2], [0.3, 0.4]],
//!  "text": "The cat sat.",
//!  "whisper_transcript": "the cat sat",
//!  "condition_on_prev": "Previously on the show"}
//! ```
//!
//! Features are either inline (`[n_mels][frames]`) or referenced through
//! `features_path`, a safetensors file holding a tensor named
//! `input_features` (resolved relative to the JSONL file). The pseudo-label is
//! either text or pre-tokenised ids (`pseudo_label_ids`).
//!
//! Two source kinds exist:
//!
//! * [`MaterializedSource`] reads every record up front; order is reshuffled
//!   on each restart.
//! * [`StreamingSource`] reads lazily and can only shuffle inside a bounded
//!   look-ahead buffer; a restart re-opens the files from the beginning.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::descriptor::DatasetDescriptor;
use crate::error::{DistillError, DistillResult};

// ── Records ───────────────────────────────────────────────────────────────────

/// Log-mel input features of one example.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureData {
    /// Row-major `[n_mels, frames]` values.
    Inline { n_mels: usize, frames: usize, values: Vec<f32> },
    /// Safetensors file with an `input_features` tensor.
    File(PathBuf),
}

/// Host-side features ready for collation.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub n_mels: usize,
    pub frames: usize,
    pub values: Vec<f32>,
}

impl FeatureData {
    /// Materialise the features on the host as F32.
    pub fn load(&self) -> DistillResult<Features> {
        match self {
            Self::Inline { n_mels, frames, values } => Ok(Features {
                n_mels: *n_mels,
                frames: *frames,
                values: values.clone(),
            }),
            Self::File(path) => {
                let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
                let t = tensors.get("input_features").ok_or_else(|| {
                    DistillError::malformed(
                        &path.display().to_string(),
                        "safetensors file has no `input_features` tensor",
                    )
                })?;
                let t = match t.rank() {
                    2 => t.clone(),
                    3 if t.dim(0)? == 1 => t.squeeze(0)?,
                    _ => {
                        return Err(DistillError::malformed(
                            &path.display().to_string(),
                            format!("expected [n_mels, frames] features, got {:?}", t.dims()),
                        ))
                    }
                };
                let (n_mels, frames) = t.dims2()?;
                let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                Ok(Features { n_mels, frames, values })
            }
        }
    }
}

/// Teacher transcription of an example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PseudoLabel {
    Text(String),
    Ids(Vec<u32>),
}

/// One record as read from a source, before any tokenisation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExample {
    pub features: FeatureData,
    /// Ground-truth transcription, when the dataset provides one.
    pub reference: Option<String>,
    pub pseudo_label: Option<PseudoLabel>,
    /// Transcription of the preceding segment of the same recording.
    pub prev_text: Option<String>,
    pub source_id: String,
    /// Position of the record within its source (0-based, file order).
    pub index: u64,
}

/// Column names used when parsing records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceColumns {
    pub text_column: String,
    pub pseudo_label_column: String,
    pub pseudo_label_ids_column: String,
    pub prev_text_column: String,
}

impl Default for SourceColumns {
    fn default() -> Self {
        Self {
            text_column: "text".to_string(),
            pseudo_label_column: "whisper_transcript".to_string(),
            pseudo_label_ids_column: "pseudo_label_ids".to_string(),
            prev_text_column: "condition_on_prev".to_string(),
        }
    }
}

/// Parse one JSONL line. `base_dir` resolves relative `features_path`s.
pub fn parse_record(
    line: &str,
    columns: &SourceColumns,
    source_id: &str,
    base_dir: &Path,
    index: u64,
) -> DistillResult<RawExample> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| DistillError::malformed(source_id, format!("record {index}: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DistillError::malformed(source_id, format!("record {index} is not an object")))?;

    let features = if let Some(v) = obj.get("input_features") {
        parse_inline_features(v).map_err(|reason| DistillError::malformed(source_id, format!("record {index}: {reason}")))?
    } else if let Some(p) = obj.get("features_path").and_then(Value::as_str) {
        let path = Path::new(p);
        FeatureData::File(if path.is_absolute() { path.to_path_buf() } else { base_dir.join(path) })
    } else {
        return Err(DistillError::malformed(source_id, format!("record {index} has no features")));
    };

    let text = |col: &str| obj.get(col).and_then(Value::as_str).map(str::to_string);

    let pseudo_label = match text(&columns.pseudo_label_column) {
        Some(t) => Some(PseudoLabel::Text(t)),
        None => match obj.get(&columns.pseudo_label_ids_column).and_then(Value::as_array) {
            Some(ids) => Some(PseudoLabel::Ids(
                ids.iter()
                    .map(|v| v.as_u64().and_then(|n| u32::try_from(n).ok()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        DistillError::malformed(source_id, format!("record {index}: pseudo-label ids must be u32 integers"))
                    })?,
            )),
            None => None,
        },
    };

    Ok(RawExample {
        features,
        reference: text(&columns.text_column),
        pseudo_label,
        prev_text: text(&columns.prev_text_column).filter(|t| !t.trim().is_empty()),
        source_id: source_id.to_string(),
        index,
    })
}

fn parse_inline_features(v: &Value) -> Result<FeatureData, String> {
    let rows = v.as_array().ok_or("input_features must be a 2-D array")?;
    if rows.is_empty() {
        return Err("input_features is empty".into());
    }
    let n_mels = rows.len();
    let mut frames = None;
    let mut values = Vec::new();
    for row in rows {
        let row = row.as_array().ok_or("input_features must be a 2-D array")?;
        match frames {
            None => frames = Some(row.len()),
            Some(f) if f != row.len() => return Err("input_features rows differ in length".into()),
            _ => {}
        }
        for x in row {
            values.push(x.as_f64().ok_or("input_features must be numeric")? as f32);
        }
    }
    let frames = frames.unwrap_or(0);
    if frames == 0 {
        return Err("input_features has zero frames".into());
    }
    Ok(FeatureData::Inline { n_mels, frames, values })
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// An ordered supply of raw examples from one dataset.
pub trait ExampleSource: Send {
    fn id(&self) -> &str;

    /// Next record. `None` means the source is exhausted for this pass;
    /// `Some(Err(_))` carries a malformed record or an IO failure.
    fn next_example(&mut self) -> Option<DistillResult<RawExample>>;

    /// Start a new pass from the beginning. `pass` seeds the reshuffle.
    fn restart(&mut self, pass: u64) -> DistillResult<()>;

    /// Number of records per pass, when known without reading everything.
    fn len_hint(&self) -> Option<usize>;
}

// ── MaterializedSource ────────────────────────────────────────────────────────

/// A finite source held entirely in memory.
pub struct MaterializedSource {
    id: String,
    entries: Vec<Result<RawExample, String>>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    seed: u64,
}

impl MaterializedSource {
    /// Read every file of `descriptor` into memory.
    pub fn open(
        descriptor: &DatasetDescriptor,
        columns: &SourceColumns,
        shuffle: bool,
        seed: u64,
    ) -> DistillResult<Self> {
        let id = descriptor.id();
        let mut entries = Vec::new();
        for path in descriptor.files()? {
            let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let index = entries.len() as u64;
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        entries.push(Err(read_error(e, &id, index)?.to_string()));
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                entries.push(parse_record(&line, columns, &id, &base_dir, index).map_err(|e| e.to_string()));
            }
            debug!(path = %path.display(), records = entries.len(), "Loaded source file");
        }
        info!(source = %id, records = entries.len(), "Dataset source materialised");
        Ok(Self::from_entries(id, entries, shuffle, seed))
    }

    /// Build a source from already-parsed examples.
    pub fn from_examples(id: impl Into<String>, examples: Vec<RawExample>, shuffle: bool, seed: u64) -> Self {
        Self::from_entries(id.into(), examples.into_iter().map(Ok).collect(), shuffle, seed)
    }

    fn from_entries(id: String, entries: Vec<Result<RawExample, String>>, shuffle: bool, seed: u64) -> Self {
        let mut source = Self {
            id,
            order: (0..entries.len()).collect(),
            entries,
            cursor: 0,
            shuffle,
            seed,
        };
        source.reorder(0);
        source
    }

    fn reorder(&mut self, pass: u64) {
        self.order = (0..self.entries.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(pass));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
    }
}

impl ExampleSource for MaterializedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn next_example(&mut self) -> Option<DistillResult<RawExample>> {
        let idx = *self.order.get(self.cursor)?;
        self.cursor += 1;
        Some(match &self.entries[idx] {
            Ok(ex) => Ok(ex.clone()),
            Err(reason) => Err(DistillError::malformed(&self.id, reason.clone())),
        })
    }

    fn restart(&mut self, pass: u64) -> DistillResult<()> {
        self.reorder(pass);
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

/// Undecodable lines are one bad record; any other read error is fatal.
/// `lines()` has already consumed the offending line, so reading can go on.
fn read_error(e: io::Error, source_id: &str, index: u64) -> DistillResult<DistillError> {
    if e.kind() == io::ErrorKind::InvalidData {
        Ok(DistillError::malformed(source_id, format!("record {index}: {e}")))
    } else {
        Err(e.into())
    }
}

// ── StreamingSource ───────────────────────────────────────────────────────────

/// A lazily read source with a bounded shuffle buffer.
pub struct StreamingSource {
    id: String,
    columns: SourceColumns,
    files: Vec<PathBuf>,
    file_idx: usize,
    lines: Option<Lines<BufReader<File>>>,
    buffer: VecDeque<DistillResult<RawExample>>,
    buffer_size: usize,
    next_index: u64,
    rng: StdRng,
    seed: u64,
}

impl StreamingSource {
    pub fn open(
        descriptor: &DatasetDescriptor,
        columns: &SourceColumns,
        buffer_size: usize,
        seed: u64,
    ) -> DistillResult<Self> {
        let files = descriptor.files()?;
        info!(source = %descriptor.id(), files = files.len(), buffer_size, "Streaming dataset source");
        Ok(Self {
            id: descriptor.id(),
            columns: columns.clone(),
            files,
            file_idx: 0,
            lines: None,
            buffer: VecDeque::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            next_index: 0,
            rng: StdRng::seed_from_u64(seed),
            seed,
        })
    }

    /// Read the next non-empty line across files, parsing it.
    fn read_one(&mut self) -> Option<DistillResult<RawExample>> {
        loop {
            if self.lines.is_none() {
                let path = self.files.get(self.file_idx)?;
                match File::open(path) {
                    Ok(f) => self.lines = Some(BufReader::new(f).lines()),
                    Err(e) => {
                        self.file_idx += 1;
                        return Some(Err(e.into()));
                    }
                }
            }
            let lines = self.lines.as_mut()?;
            match lines.next() {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    let base_dir = self.files[self.file_idx].parent().unwrap_or(Path::new(".")).to_path_buf();
                    let index = self.next_index;
                    self.next_index += 1;
                    return Some(parse_record(&line, &self.columns, &self.id, &base_dir, index));
                }
                Some(Err(e)) => {
                    let index = self.next_index;
                    self.next_index += 1;
                    return Some(Err(read_error(e, &self.id, index).unwrap_or_else(|fatal| fatal)));
                }
                None => {
                    self.lines = None;
                    self.file_idx += 1;
                }
            }
        }
    }
}

impl ExampleSource for StreamingSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn next_example(&mut self) -> Option<DistillResult<RawExample>> {
        while self.buffer.len() < self.buffer_size {
            match self.read_one() {
                Some(item) => self.buffer.push_back(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let pick = self.rng.gen_range(0..self.buffer.len());
        self.buffer.swap_remove_back(pick)
    }

    fn restart(&mut self, pass: u64) -> DistillResult<()> {
        self.file_idx = 0;
        self.lines = None;
        self.buffer.clear();
        self.next_index = 0;
        self.rng = StdRng::seed_from_u64(self.seed.wrapping_add(pass));
        Ok(())
    }

    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Open the source for `descriptor`.
///
/// `shuffle` only applies to materialised sources; a streaming source always
/// draws from its look-ahead buffer (size 1 keeps file order).
pub fn open_source(
    descriptor: &DatasetDescriptor,
    columns: &SourceColumns,
    streaming: bool,
    shuffle: bool,
    shuffle_buffer_size: usize,
    seed: u64,
) -> DistillResult<Box<dyn ExampleSource>> {
    let columns = SourceColumns { text_column: descriptor.text_column.clone(), ..columns.clone() };
    if streaming {
        let buffer = if shuffle { shuffle_buffer_size } else { 1 };
        Ok(Box::new(StreamingSource::open(descriptor, &columns, buffer, seed)?))
    } else {
        Ok(Box::new(MaterializedSource::open(descriptor, &columns, shuffle, seed)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_source(dir: &Path, lines: &[&str]) -> DatasetDescriptor {
        fs::write(dir.join("train-00000.jsonl"), lines.join("\n")).unwrap();
        DatasetDescriptor {
            source: dir.display().to_string(),
            config: "default".into(),
            split: "train".into(),
            text_column: "sentence".into(),
            weight: 1.0,
        }
    }

    fn record(i: usize) -> String {
        format!(r#"{{"input_features": [[{i}.0, 1.0]], "sentence": "ref {i}", "whisper_transcript": "hyp {i}"}}"#)
    }

    #[test]
    fn parse_inline_record_with_custom_text_column() {
        let columns = SourceColumns { text_column: "sentence".into(), ..Default::default() };
        let ex = parse_record(&record(3), &columns, "src", Path::new("."), 7).unwrap();
        assert_eq!(ex.reference.as_deref(), Some("ref 3"));
        assert_eq!(ex.pseudo_label, Some(PseudoLabel::Text("hyp 3".into())));
        assert_eq!(ex.index, 7);
        assert_eq!(
            ex.features,
            FeatureData::Inline { n_mels: 1, frames: 2, values: vec![3.0, 1.0] }
        );
    }

    #[test]
    fn parse_pseudo_label_ids_and_prev() {
        let line = r#"{"features_path": "f.safetensors", "pseudo_label_ids": [1, 2, 3], "condition_on_prev": "before"}"#;
        let ex = parse_record(line, &SourceColumns::default(), "src", Path::new("/data"), 0).unwrap();
        assert_eq!(ex.pseudo_label, Some(PseudoLabel::Ids(vec![1, 2, 3])));
        assert_eq!(ex.prev_text.as_deref(), Some("before"));
        assert_eq!(ex.features, FeatureData::File(PathBuf::from("/data/f.safetensors")));
        assert!(ex.reference.is_none());
    }

    #[test]
    fn malformed_records_are_reported() {
        let cols = SourceColumns::default();
        for line in [
            "not json",
            r#"{"text": "no features"}"#,
            r#"{"input_features": [[1.0], [1.0, 2.0]]}"#,
            r#"{"input_features": [[]]}"#,
            r#"{"input_features": [[1.0]], "pseudo_label_ids": [1, 4294967296]}"#,
        ] {
            let err = parse_record(line, &cols, "src", Path::new("."), 0).unwrap_err();
            assert!(matches!(err, DistillError::MalformedExample { .. }), "{line}");
        }
    }

    #[test]
    fn inline_features_load_verbatim() {
        let data = FeatureData::Inline { n_mels: 2, frames: 1, values: vec![0.5, 0.25] };
        let f = data.load().unwrap();
        assert_eq!((f.n_mels, f.frames), (2, 1));
        assert_eq!(f.values, vec![0.5, 0.25]);
    }

    #[test]
    fn features_from_safetensors_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.safetensors");
        let t = candle_core::Tensor::arange(0f32, 6.0, &Device::Cpu).unwrap().reshape((1, 2, 3)).unwrap();
        candle_core::safetensors::save(&std::collections::HashMap::from([("input_features".to_string(), t)]), &path)
            .unwrap();
        let f = FeatureData::File(path).load().unwrap();
        assert_eq!((f.n_mels, f.frames), (2, 3));
        assert_eq!(f.values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn materialized_source_yields_all_then_none() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (0..5).map(record).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let d = write_source(dir.path(), &refs);
        let mut src = open_source(&d, &SourceColumns::default(), false, true, 0, 1).unwrap();
        assert_eq!(src.len_hint(), Some(5));

        let mut seen: Vec<String> = std::iter::from_fn(|| src.next_example())
            .map(|r| r.unwrap().reference.unwrap())
            .collect();
        assert!(src.next_example().is_none());
        seen.sort();
        assert_eq!(seen, vec!["ref 0", "ref 1", "ref 2", "ref 3", "ref 4"]);

        src.restart(1).unwrap();
        assert_eq!(std::iter::from_fn(|| src.next_example()).count(), 5);
    }

    #[test]
    fn unshuffled_materialized_keeps_file_order() {
        let dir = TempDir::new().unwrap();
        let d = write_source(dir.path(), &[&record(0), "garbage", &record(2)]);
        let mut src = open_source(&d, &SourceColumns::default(), false, false, 0, 1).unwrap();
        assert_eq!(src.next_example().unwrap().unwrap().reference.as_deref(), Some("ref 0"));
        assert!(matches!(src.next_example(), Some(Err(DistillError::MalformedExample { .. }))));
        assert_eq!(src.next_example().unwrap().unwrap().reference.as_deref(), Some("ref 2"));
        assert!(src.next_example().is_none());
    }

    #[test]
    fn streaming_source_restarts_from_beginning() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (0..4).map(record).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let d = write_source(dir.path(), &refs);

        let mut src = open_source(&d, &SourceColumns::default(), true, false, 8, 3).unwrap();
        assert_eq!(src.len_hint(), None);
        let first: Vec<_> = std::iter::from_fn(|| src.next_example()).map(|r| r.unwrap().index).collect();
        assert_eq!(first, vec![0, 1, 2, 3]);

        src.restart(1).unwrap();
        let second: Vec<_> = std::iter::from_fn(|| src.next_example()).map(|r| r.unwrap().index).collect();
        assert_eq!(second, first);
    }

    #[test]
    fn streaming_shuffle_is_a_permutation() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (0..20).map(record).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let d = write_source(dir.path(), &refs);

        let mut src = open_source(&d, &SourceColumns::default(), true, true, 4, 9).unwrap();
        let mut idx: Vec<u64> = std::iter::from_fn(|| src.next_example()).map(|r| r.unwrap().index).collect();
        idx.sort();
        assert_eq!(idx, (0..20).collect::<Vec<u64>>());
    }

    #[test]
    fn undecodable_line_is_a_malformed_record_in_both_modes() {
        let dir = TempDir::new().unwrap();
        let mut bytes = Vec::new();
        for i in 0..2 {
            bytes.extend_from_slice(record(i).as_bytes());
            bytes.push(b'\n');
        }
        bytes.extend_from_slice(b"\xff\xfe not utf-8\n");
        for i in 2..4 {
            bytes.extend_from_slice(record(i).as_bytes());
            bytes.push(b'\n');
        }
        let d = write_source(dir.path(), &[]);
        fs::write(dir.path().join("train-00000.jsonl"), bytes).unwrap();

        for streaming in [false, true] {
            let mut src = open_source(&d, &SourceColumns::default(), streaming, false, 1, 0).unwrap();
            let results: Vec<_> = std::iter::from_fn(|| src.next_example()).collect();
            assert_eq!(results.len(), 5, "streaming={streaming}");

            let bad: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
            assert_eq!(bad.len(), 1, "streaming={streaming}");
            assert!(matches!(bad[0], DistillError::MalformedExample { .. }));
            assert!(!bad[0].is_fatal());

            let refs: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()?.reference.clone()).collect();
            assert_eq!(refs, vec!["ref 0", "ref 1", "ref 2", "ref 3"], "streaming={streaming}");
        }
    }
}
