// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Boundary-aware document chunking.
//!
//! Targets ~800 tokens per chunk with ~100 tokens of overlap, honoring
//! paragraph, sentence and word boundaries in that order. Hard limits: a
//! chunk never exceeds 1,200 tokens, and no split produces a chunk under
//! 500 tokens — a short tail is merged into its predecessor instead.
//! Tokens are approximated at four characters each.

/// Characters per approximate token.
const CHARS_PER_TOKEN: usize = 4;

pub const TARGET_TOKENS: usize = 800;
pub const OVERLAP_TOKENS: usize = 100;
pub const MIN_TOKENS: usize = 500;
pub const MAX_TOKENS: usize = 1_200;

/// One chunk of a document, with contiguous ordinals from zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub ordinal: i64,
    pub text: String,
    pub token_count: i64,
    pub offset_start: i64,
    pub offset_end: i64,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    target_chars: usize,
    overlap_chars: usize,
    min_chars: usize,
    max_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            target_chars: TARGET_TOKENS * CHARS_PER_TOKEN,
            overlap_chars: OVERLAP_TOKENS * CHARS_PER_TOKEN,
            min_chars: MIN_TOKENS * CHARS_PER_TOKEN,
            max_chars: MAX_TOKENS * CHARS_PER_TOKEN,
        }
    }
}

impl Chunker {
    /// Chunker with custom token targets (tests use small windows).
    pub fn with_token_sizes(target: usize, overlap: usize, min: usize, max: usize) -> Self {
        Self {
            target_chars: target * CHARS_PER_TOKEN,
            overlap_chars: overlap * CHARS_PER_TOKEN,
            min_chars: min * CHARS_PER_TOKEN,
            max_chars: max * CHARS_PER_TOKEN,
        }
    }

    /// Split `text` into chunks. Empty (or whitespace-only) input yields an
    /// empty list; the ingestion pipeline treats that as a rejected upload.
    pub fn chunk(&self, text: &str) -> Vec<ChunkSpan> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if text.len() <= self.max_chars {
            return vec![span(0, text, 0)];
        }

        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut start = 0usize;
        while start < text.len() {
            let remaining = text.len() - start;
            if remaining <= self.max_chars {
                spans.push((start, text.len()));
                break;
            }
            let target = start + self.target_chars.min(remaining);
            let mut end = find_boundary(text, target, self.target_chars / 5);
            // The boundary search can only move backwards; make sure the
            // chunk still meets the minimum and the loop advances.
            if end <= start + self.min_chars {
                end = char_boundary(text, start + self.target_chars);
            }
            spans.push((start, end));
            // Step forward with overlap, aligned to a word boundary.
            let next = end.saturating_sub(self.overlap_chars).max(start + 1);
            start = word_start(text, char_boundary(text, next));
        }

        // Merge an under-minimum tail into its predecessor when the result
        // stays within the hard maximum.
        if spans.len() >= 2 {
            let (last_start, last_end) = spans[spans.len() - 1];
            if last_end - last_start < self.min_chars {
                let (prev_start, _) = spans[spans.len() - 2];
                if last_end - prev_start <= self.max_chars {
                    spans.pop();
                    let idx = spans.len() - 1;
                    spans[idx] = (prev_start, last_end);
                }
            }
        }

        spans
            .into_iter()
            .enumerate()
            .map(|(i, (s, e))| span(i as i64, &text[s..e], s))
            .collect()
    }
}

fn span(ordinal: i64, text: &str, offset: usize) -> ChunkSpan {
    ChunkSpan {
        ordinal,
        text: text.to_string(),
        token_count: (text.len() / CHARS_PER_TOKEN).max(1) as i64,
        offset_start: offset as i64,
        offset_end: (offset + text.len()) as i64,
    }
}

/// Find the best split position at or before `target`, looking back at most
/// `window` bytes. Prefers paragraph breaks, then single newlines, then
/// sentence ends, then word breaks.
fn find_boundary(text: &str, target: usize, window: usize) -> usize {
    let target = char_boundary(text, target.min(text.len()));
    if target >= text.len() {
        return text.len();
    }
    let search_start = char_boundary(text, target.saturating_sub(window));
    let region = &text[search_start..target];

    if let Some(pos) = region.rfind("\n\n") {
        return search_start + pos + 2;
    }
    if let Some(pos) = region.rfind('\n') {
        return search_start + pos + 1;
    }
    for (i, c) in region.char_indices().rev() {
        if matches!(c, '.' | '!' | '?') {
            let after = search_start + i + c.len_utf8();
            if text[after..].starts_with(' ') || after == text.len() {
                return after;
            }
        }
    }
    if let Some(pos) = region.rfind(' ') {
        return search_start + pos + 1;
    }
    target
}

/// Largest valid char boundary at or below `pos`.
fn char_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Snap a position forward to the start of the next word, so overlap windows
/// never begin mid-word.
fn word_start(text: &str, pos: usize) -> usize {
    if pos >= text.len() || pos == 0 {
        return pos;
    }
    match text[pos..].find(' ') {
        Some(offset) if offset < 32 => pos + offset + 1,
        _ => pos,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(n: usize) -> String {
        (0..n)
            .map(|i| format!("Sentence number {i} carries a little bit of content. "))
            .collect()
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(Chunker::default().chunk("").is_empty());
        assert!(Chunker::default().chunk("   \n\n ").is_empty());
    }

    #[test]
    fn short_document_is_a_single_chunk() {
        let chunks = Chunker::default().chunk("a small note");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].offset_start, 0);
    }

    #[test]
    fn ordinals_are_contiguous_from_zero() {
        let text = sentences(2_000);
        let chunks = Chunker::default().chunk(&text);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as i64);
        }
    }

    #[test]
    fn chunks_respect_hard_limits() {
        let text = sentences(3_000);
        let chunks = Chunker::default().chunk(&text);
        for c in &chunks {
            assert!(c.token_count as usize <= MAX_TOKENS, "chunk over max: {}", c.token_count);
        }
        // Every chunk but possibly the merged tail meets the minimum.
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.token_count as usize >= MIN_TOKENS, "chunk under min: {}", c.token_count);
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = sentences(2_000);
        let chunks = Chunker::default().chunk(&text);
        for pair in chunks.windows(2) {
            assert!(
                pair[1].offset_start < pair[0].offset_end,
                "chunks {} and {} do not overlap",
                pair[0].ordinal,
                pair[1].ordinal
            );
        }
    }

    #[test]
    fn splits_fall_on_word_boundaries() {
        let text = sentences(2_000);
        let chunks = Chunker::default().chunk(&text);
        for c in &chunks[..chunks.len() - 1] {
            assert!(
                c.text.ends_with(' ') || c.text.ends_with('\n') || c.text.ends_with('.'),
                "chunk {} ends mid-word: ...{:?}",
                c.ordinal,
                &c.text[c.text.len().saturating_sub(12)..]
            );
        }
    }

    #[test]
    fn prefers_paragraph_breaks() {
        // Two paragraphs sized so the target lands shortly after the break.
        let para = "word ".repeat(620);
        let text = format!("{para}\n\n{para}");
        let chunks = Chunker::default().chunk(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].text.ends_with("\n\n"), "split should land on the paragraph break");
    }

    #[test]
    fn multibyte_text_never_panics() {
        let text = "månsklig förståelse — мир и дружба. ".repeat(2_000);
        let chunks = Chunker::default().chunk(&text);
        assert!(!chunks.is_empty());
        // Re-slicing at the recorded offsets must stay on char boundaries.
        for c in &chunks {
            let _ = &text[c.offset_start as usize..c.offset_end as usize];
        }
    }
}
