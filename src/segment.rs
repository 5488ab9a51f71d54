//! Sentence-aware splitting of text blocks into synthesis-sized segments.
//!
//! Lengths are counted in UTF-16 code units, which is what speech engines
//! built on platform string types measure their input limits in.

use crate::error::{BookError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Hard limit for one segment.
pub const MAX_SEGMENT_UNITS: usize = 4000;
/// Blocks shorter than this are never split.
pub const SPLIT_THRESHOLD_UNITS: usize = MAX_SEGMENT_UNITS - 1;

/// A period, a space, then the uppercase letter that starts the next sentence.
static RE_SENTENCE_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\. [A-Z]").unwrap());

pub fn code_units(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Split one block into segments.
///
/// The `". "` of each boundary stays with the sentence before it, so the
/// segments concatenate back to the input and every segment but the last
/// ends with `". "`. A single sentence over the limit is returned as-is.
pub fn split(text: &str) -> Result<Vec<String>> {
    let len = code_units(text);
    if len < SPLIT_THRESHOLD_UNITS {
        return Ok(vec![text.to_string()]);
    }

    let sentences = sentences(text);
    if sentences.len() < 2 {
        return Err(BookError::UnsplittableBlock {
            len,
            preview: preview(text),
        });
    }

    let mut segments = Vec::new();
    let mut buffer = String::new();
    let mut buffer_units = 0usize;
    for sentence in sentences {
        let units = code_units(sentence);
        if !buffer.is_empty() && buffer_units + units >= MAX_SEGMENT_UNITS {
            segments.push(std::mem::take(&mut buffer));
            buffer_units = 0;
        }
        buffer.push_str(sentence);
        buffer_units += units;
    }
    segments.push(buffer);
    Ok(segments)
}

/// Cut after every `". "` that is followed by an uppercase letter.
fn sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for boundary in RE_SENTENCE_BOUNDARY.find_iter(text) {
        // The match is ". X"; the next sentence starts at X.
        let cut = boundary.start() + 2;
        pieces.push(&text[start..cut]);
        start = cut;
    }
    pieces.push(&text[start..]);
    pieces
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(80).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_text(unit: &str, min_len: usize) -> String {
        let mut text = String::new();
        while text.len() < min_len {
            text.push_str(unit);
        }
        text
    }

    #[test]
    fn short_blocks_are_returned_unchanged() {
        let text = "Short. Text here.";
        assert_eq!(split(text).unwrap(), vec![text.to_string()]);
        let edge = "x".repeat(SPLIT_THRESHOLD_UNITS - 1);
        assert_eq!(split(&edge).unwrap(), vec![edge.clone()]);
    }

    #[test]
    fn repeated_short_sentences_split_under_the_limit() {
        let text = long_text("A. B. C. ", 5000);
        let text = text.trim_end().to_string();
        let segments = split(&text).unwrap();

        assert!(segments.len() > 1);
        for segment in &segments {
            assert!(code_units(segment) < MAX_SEGMENT_UNITS);
        }
        for segment in &segments[..segments.len() - 1] {
            assert!(segment.ends_with(". "), "segment should end at a boundary");
        }
        assert_eq!(segments.concat(), text);
    }

    #[test]
    fn rejoined_segments_reconstruct_the_input() {
        let text = long_text("The quick fox jumps. Over the lazy dog again. ", 9000);
        let segments = split(&text).unwrap();
        assert!(segments.len() >= 3);
        assert_eq!(segments.concat(), text);
    }

    #[test]
    fn lowercase_after_period_is_not_a_boundary() {
        let text = format!("{}. and then. Next", "a".repeat(4000));
        let pieces = sentences(&text);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[1].starts_with("Next"));
    }

    #[test]
    fn block_without_boundaries_is_unsplittable() {
        let text = "word ".repeat(1000);
        let err = split(&text).expect_err("no sentence boundary");
        assert!(matches!(err, BookError::UnsplittableBlock { len: 5000, .. }));
    }

    #[test]
    fn oversized_single_sentence_is_kept_whole() {
        let giant = format!("{}. ", "x".repeat(4100));
        let text = format!("{giant}Tail.");
        let segments = split(&text).unwrap();
        assert_eq!(segments, vec![giant, "Tail.".to_string()]);
        assert!(code_units(&segments[0]) >= MAX_SEGMENT_UNITS);
    }

    #[test]
    fn lengths_count_utf16_code_units() {
        assert_eq!(code_units("abc"), 3);
        assert_eq!(code_units("\u{e9}"), 1);
        assert_eq!(code_units("\u{1F600}"), 2);
    }

    #[test]
    fn splitting_is_deterministic() {
        let text = long_text("Alpha beta. Gamma delta. ", 8200);
        assert_eq!(split(&text).unwrap(), split(&text).unwrap());
    }
}
