//! Sentence-aware sliding-window chunker.
//!
//! Text is cut into sentences (paragraph breaks and line breaks also end a
//! sentence), then sentences are packed greedily into chunks of at most
//! `max_chars`. A chunk closes early at a paragraph break once it has reached
//! `min_chars`. Consecutive chunks within a paragraph share trailing
//! sentences totalling at most `overlap_chars`. A sentence longer than
//! `max_chars` is hard-split at the size boundary; nothing else is ever split
//! mid-sentence.
//!
//! Every chunk is a slice of the input, so identical text and parameters
//! always give identical boundaries.

use once_cell::sync::Lazy;
use regex::Regex;

use campuskb_core::text::estimate_tokens;
use campuskb_core::ChunkingConfig;
use campuskb_store::{chunk_id, Chunk};

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").unwrap());
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[.!?]+["')\]]*(\s+)"#).unwrap());

/// A sentence as a byte range of the source text.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    end: usize,
    paragraph_end: bool,
}

pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk a document's normalized text.
    pub fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let chars = CharIndex::new(text);
        let spans = self.hard_split(text, &chars, sentence_spans(text));
        if spans.is_empty() {
            return Vec::new();
        }

        let len = |a: usize, b: usize| chars.count(spans[a].start, spans[b - 1].end);
        let max = self.config.max_chars;
        let min = self.config.min_chars;

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut start = 0;
        loop {
            let mut end = start + 1;
            while end < spans.len() && len(start, end + 1) <= max {
                if spans[end - 1].paragraph_end && len(start, end) >= min {
                    break;
                }
                end += 1;
            }
            ranges.push((start, end));
            if end == spans.len() {
                break;
            }

            // Carry trailing sentences forward, as long as they fit the
            // overlap budget and still leave room for the next sentence.
            // Nothing is carried across a paragraph break.
            let mut carry = 0;
            while !spans[end - 1].paragraph_end
                && carry + 1 < end - start
                && len(end - carry - 1, end) <= self.config.overlap_chars
                && len(end - carry - 1, end + 1) <= max
            {
                carry += 1;
            }
            start = end - carry;
        }

        // Fold a short tail into its predecessor when the result still fits.
        if ranges.len() > 1 {
            let (tail_start, tail_end) = ranges[ranges.len() - 1];
            let (prev_start, _) = ranges[ranges.len() - 2];
            if len(tail_start, tail_end) < min && len(prev_start, tail_end) <= max {
                ranges.pop();
                if let Some(prev) = ranges.last_mut() {
                    prev.1 = tail_end;
                }
            }
        }

        ranges
            .into_iter()
            .enumerate()
            .map(|(ordinal, (a, b))| {
                let (start, end) = (spans[a].start, spans[b - 1].end);
                let body = &text[start..end];
                Chunk {
                    id: chunk_id(document_id, ordinal as u32),
                    document_id: document_id.to_string(),
                    ordinal: ordinal as u32,
                    text: body.to_string(),
                    start,
                    end,
                    token_estimate: estimate_tokens(body),
                }
            })
            .collect()
    }

    /// Split any sentence longer than `max_chars` at char boundaries.
    fn hard_split(&self, text: &str, chars: &CharIndex, spans: Vec<Span>) -> Vec<Span> {
        let max = self.config.max_chars;
        let mut out = Vec::with_capacity(spans.len());
        for span in spans {
            if chars.count(span.start, span.end) <= max {
                out.push(span);
                continue;
            }
            let mut piece_start = span.start;
            let mut taken = 0;
            for (offset, _) in text[span.start..span.end].char_indices() {
                if taken == max {
                    push_trimmed(text, &mut out, piece_start, span.start + offset, false);
                    piece_start = span.start + offset;
                    taken = 0;
                }
                taken += 1;
            }
            push_trimmed(text, &mut out, piece_start, span.end, span.paragraph_end);
        }
        out
    }
}

/// Sentence spans, trimmed, with the last sentence of each paragraph marked.
fn sentence_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut para_start = 0;
    let mut paragraphs: Vec<(usize, usize)> = PARAGRAPH_BREAK
        .find_iter(text)
        .map(|m| {
            let para = (para_start, m.start());
            para_start = m.end();
            para
        })
        .collect();
    paragraphs.push((para_start, text.len()));

    for (p_start, p_end) in paragraphs {
        let before = spans.len();
        let mut line_start = p_start;
        for line in text[p_start..p_end].split('\n') {
            let line_end = line_start + line.len();
            let mut sentence_start = line_start;
            for caps in SENTENCE_END.captures_iter(line) {
                if let Some(gap) = caps.get(1) {
                    push_trimmed(text, &mut spans, sentence_start, line_start + gap.start(), false);
                    sentence_start = line_start + gap.end();
                }
            }
            push_trimmed(text, &mut spans, sentence_start, line_end, false);
            line_start = line_end + 1;
        }
        if spans.len() > before {
            if let Some(last) = spans.last_mut() {
                last.paragraph_end = true;
            }
        }
    }
    spans
}

fn push_trimmed(text: &str, spans: &mut Vec<Span>, start: usize, end: usize, paragraph_end: bool) {
    let slice = &text[start..end];
    let trimmed_start = start + (slice.len() - slice.trim_start().len());
    let trimmed_end = start + slice.trim_end().len();
    if trimmed_start < trimmed_end {
        spans.push(Span {
            start: trimmed_start,
            end: trimmed_end,
            paragraph_end,
        });
    }
}

/// Converts byte ranges into character counts in O(log n).
struct CharIndex {
    boundaries: Vec<usize>,
}

impl CharIndex {
    fn new(text: &str) -> Self {
        Self {
            boundaries: text.char_indices().map(|(i, _)| i).collect(),
        }
    }

    fn count(&self, start: usize, end: usize) -> usize {
        self.boundaries.partition_point(|&b| b < end) - self.boundaries.partition_point(|&b| b < start)
    }
}
