//! Text normalisation applied before word-error-rate comparison.
//!
//! The same normaliser must be applied to the reference and to the
//! pseudo-label, otherwise casing or punctuation differences count as errors.

/// Maps raw text to a canonical, comparable form.
pub trait TextNormalizer: Send + Sync {
    fn normalize(&self, text: &str) -> String;
}

/// Language-agnostic normaliser in the style of Whisper's basic normaliser.
///
/// 1. Drops `<|...|>` control/timestamp markup.
/// 2. Drops bracketed annotations: `[laughter]`, `(inaudible)`.
/// 3. Lower-cases.
/// 4. Replaces every character that is neither alphanumeric nor whitespace
///    with a space.
/// 5. Collapses runs of whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTextNormalizer;

impl TextNormalizer for BasicTextNormalizer {
    fn normalize(&self, text: &str) -> String {
        let text = strip_timestamp_markup(text);
        let text = strip_bracketed(&text);
        let cleaned: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect();
        cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Remove every `<|...|>` span (timestamps such as `<|1.20|>` and control
/// tokens). An unterminated `<|` is kept verbatim.
pub fn strip_timestamp_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|") {
        match rest[start + 2..].find("|>") {
            Some(len) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + 2 + len + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Remove `[...]` and `(...)` spans, including nested ones.
fn strip_bracketed(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}
