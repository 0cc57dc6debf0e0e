//! Extractive generator: answers with the grounding sentences that best match
//! the query. Needs no network and never invents text.

use std::collections::BTreeSet;

use futures::future::BoxFuture;

use campuskb_core::text::{estimate_tokens, term_overlap, term_set};

use crate::generator::ResponseGenerator;
use crate::types::{Generation, GenerationError, GenerationParams, Prompt};

pub const NO_ANSWER: &str = "I couldn't find that in the campus knowledge base. \
     Please check with the relevant campus office.";

const MAX_SENTENCES: usize = 3;
/// Sentences scoring below this fraction of the best one are left out.
const RELATIVE_CUTOFF: f32 = 0.6;

#[derive(Debug, Clone, Default)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn answer(&self, prompt: &Prompt) -> String {
        let query_terms = term_set(&prompt.query);
        if query_terms.is_empty() {
            return NO_ANSWER.to_string();
        }

        // (score, rank, position, sentence)
        let mut scored: Vec<(f32, usize, usize, &str)> = Vec::new();
        for item in &prompt.context {
            for (pos, sentence) in sentences(&item.text).into_iter().enumerate() {
                let score = overlap(&query_terms, sentence);
                if score > 0.0 {
                    scored.push((score, item.rank, pos, sentence));
                }
            }
        }
        let Some(best) = scored.iter().map(|s| s.0).reduce(f32::max) else {
            return NO_ANSWER.to_string();
        };

        scored.retain(|s| s.0 >= best * RELATIVE_CUTOFF);
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        scored.truncate(MAX_SENTENCES);
        scored.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        scored
            .iter()
            .map(|(_, rank, _, sentence)| format!("{} [{}]", sentence, rank))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn overlap(query_terms: &BTreeSet<String>, sentence: &str) -> f32 {
    term_overlap(query_terms, &term_set(sentence))
}

/// Split on sentence punctuation followed by whitespace, and on newlines.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => Some(i),
            '.' | '!' | '?' => match chars.peek() {
                Some((_, next)) if next.is_whitespace() => Some(i + c.len_utf8()),
                None => Some(i + c.len_utf8()),
                _ => None,
            },
            _ => None,
        };
        if let Some(end) = boundary {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

impl ResponseGenerator for ExtractiveGenerator {
    fn generate<'a>(
        &'a self,
        prompt: &'a Prompt,
        _params: GenerationParams,
    ) -> BoxFuture<'a, Result<Generation, GenerationError>> {
        Box::pin(async move {
            let text = self.answer(prompt);
            Ok(Generation {
                tokens_used: estimate_tokens(&text),
                text,
                model: "extractive".into(),
            })
        })
    }
}
