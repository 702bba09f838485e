//! Output filtering
//!
//! Separates model output from the prompt echo and log noise a CLI prints
//! before it, and cleans the final text.

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker appended to CLI prompts; everything the binary prints after it is output
pub const OUTPUT_SENTINEL: &str = "<|OUTPUT|>";

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-9;]*[A-Za-z]").expect("valid ANSI regex"));
static BRACKET_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\|[^>]+\|>").expect("valid tag regex"));

/// Swallows chunks until the sentinel has been seen, then passes text through
#[derive(Debug, Clone)]
pub struct StreamingOutputFilter {
    sentinel: String,
    found: bool,
    /// Tail of the text seen so far, shorter than the sentinel
    carry: String,
}

impl Default for StreamingOutputFilter {
    fn default() -> Self {
        Self::new(OUTPUT_SENTINEL)
    }
}

impl StreamingOutputFilter {
    pub fn new(sentinel: impl Into<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            found: false,
            carry: String::new(),
        }
    }

    /// Whether the sentinel has been seen
    pub fn is_open(&self) -> bool {
        self.found
    }

    /// Text swallowed so far that is still held back (pre-sentinel tail)
    pub fn pending(&self) -> &str {
        &self.carry
    }

    /// Feed one chunk; returns the text to emit, if any
    pub fn process(&mut self, chunk: &str) -> Option<String> {
        if self.found {
            return (!chunk.is_empty()).then(|| chunk.to_string());
        }

        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(chunk);

        if let Some(idx) = buffer.find(&self.sentinel) {
            self.found = true;
            let rest = &buffer[idx + self.sentinel.len()..];
            return (!rest.is_empty()).then(|| rest.to_string());
        }

        let keep = self.sentinel.len().saturating_sub(1);
        let mut start = buffer.len().saturating_sub(keep);
        while !buffer.is_char_boundary(start) {
            start += 1;
        }
        self.carry = buffer[start..].to_string();
        None
    }
}

/// Remove ANSI escapes, anything up to the sentinel and `<|...|>` tags, then trim
pub fn clean_output(raw: &str, sentinel: &str) -> String {
    let text = ANSI_ESCAPE.replace_all(raw, "");
    let text = match text.find(sentinel) {
        Some(idx) if !sentinel.is_empty() => &text[idx + sentinel.len()..],
        _ => &text[..],
    };
    BRACKET_TAG.replace_all(text, "").trim().to_string()
}

/// Turns raw byte chunks into text without splitting multi-byte characters
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete character decoded so far
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Invalid sequence in the middle: replace and keep going
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is left, lossily
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_split_across_chunks() {
        let mut filter = StreamingOutputFilter::default();
        let out: Vec<Option<String>> = ["pre", "amble<|OUT", "PUT|>hello", " world"]
            .iter()
            .map(|c| filter.process(c))
            .collect();
        assert_eq!(
            out,
            vec![None, None, Some("hello".to_string()), Some(" world".to_string())]
        );
        assert!(filter.is_open());
    }

    #[test]
    fn test_sentinel_at_chunk_end() {
        let mut filter = StreamingOutputFilter::default();
        assert_eq!(filter.process("echo\n\n<|OUTPUT|>"), None);
        assert_eq!(filter.process("\nHi"), Some("\nHi".to_string()));
    }

    #[test]
    fn test_no_sentinel_swallows_everything() {
        let mut filter = StreamingOutputFilter::default();
        assert_eq!(filter.process("loading model"), None);
        assert_eq!(filter.process("... done"), None);
        assert!(!filter.is_open());
        assert!(filter.pending().len() < OUTPUT_SENTINEL.len());
    }

    #[test]
    fn test_carry_respects_char_boundaries() {
        let mut filter = StreamingOutputFilter::default();
        assert_eq!(filter.process("héllo wörld ünïcode"), None);
        assert_eq!(filter.process("<|OUTPUT|>ok"), Some("ok".to_string()));
    }

    #[test]
    fn test_clean_output() {
        let raw = "\x1B[1mprompt echo\x1B[0m\n<|OUTPUT|>\n Hello <|im_end|> there \n";
        assert_eq!(clean_output(raw, OUTPUT_SENTINEL), "Hello  there");
        assert_eq!(clean_output("  plain  ", OUTPUT_SENTINEL), "plain");
    }

    #[test]
    fn test_utf8_accumulator_splits() {
        let bytes = "añb€".as_bytes();
        let mut acc = Utf8Accumulator::new();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&acc.push(std::slice::from_ref(b)));
        }
        out.push_str(&acc.finish());
        assert_eq!(out, "añb€");
    }

    #[test]
    fn test_utf8_accumulator_invalid_bytes() {
        let mut acc = Utf8Accumulator::new();
        assert_eq!(acc.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }
}
