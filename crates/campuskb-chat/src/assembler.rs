//! Context assembler: retrieval result + history + persona -> bounded prompt.
//!
//! The budget is measured in characters over all message contents. When the
//! inputs do not fit, the oldest history turns go first, then the
//! lowest-ranked chunks. The current query and the system instructions are
//! never cut; if they alone exceed the budget the request is rejected.

use tracing::debug;

use campuskb_core::{AssemblyConfig, Error, Message, PersonaConfig, Result};
use campuskb_retrieve::RetrievalResult;

use crate::persona::{self, GROUNDED_RULES, UNGROUNDED_RULES};
use crate::types::{ContextItem, Prompt};

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    config: AssemblyConfig,
}

impl ContextAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Budget for a first attempt.
    pub fn budget(&self) -> usize {
        self.config.budget_chars
    }

    /// Strictly smaller budget for the single retry.
    pub fn retry_budget(&self) -> usize {
        self.config.retry_budget()
    }

    pub fn assemble(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
        history: &[Message],
        persona: &PersonaConfig,
        budget: usize,
    ) -> Result<Prompt> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidRequest("message must not be empty".into()));
        }

        // Retention window: only the most recent turns are candidates at all.
        let retained = history.len().min(self.config.max_history_turns);
        let retention_dropped = history.len() - retained;
        let window = history[history.len() - retained..].to_vec();

        let context: Vec<ContextItem> = retrieval
            .iter()
            .enumerate()
            .map(|(i, hit)| ContextItem {
                rank: i + 1,
                title: hit.record.title.clone(),
                source: hit.record.source.clone(),
                text: hit.record.chunk.text.clone(),
                score: hit.score,
            })
            .collect();

        self.fit(query, context, window, retention_dropped, persona, budget, |grounded| {
            if grounded {
                GROUNDED_RULES.to_string()
            } else {
                UNGROUNDED_RULES.to_string()
            }
        })
    }

    /// Prompt for a programming question: no reference material, code-support rules.
    pub fn assemble_code(
        &self,
        query: &str,
        language: Option<&str>,
        history: &[Message],
        persona: &PersonaConfig,
        budget: usize,
    ) -> Result<Prompt> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidRequest("message must not be empty".into()));
        }
        let retained = history.len().min(self.config.max_history_turns);
        let window = history[history.len() - retained..].to_vec();
        let rules = persona::code_rules(language);
        self.fit(
            query,
            Vec::new(),
            window,
            history.len() - retained,
            persona,
            budget,
            |_| rules.clone(),
        )
    }

    /// Drop history, then the lowest-ranked chunks, until the prompt fits.
    #[allow(clippy::too_many_arguments)]
    fn fit(
        &self,
        query: &str,
        context: Vec<ContextItem>,
        history: Vec<Message>,
        retention_dropped: usize,
        persona: &PersonaConfig,
        budget: usize,
        rules: impl Fn(bool) -> String,
    ) -> Result<Prompt> {
        let base = persona::instructions(persona);
        let mut prompt = Prompt {
            system: String::new(),
            context,
            history,
            query: query.to_string(),
            budget,
            dropped_turns: retention_dropped,
            dropped_chunks: 0,
        };

        loop {
            prompt.system = format!("{}\n\n{}", base, rules(prompt.is_grounded()));

            let len = prompt.char_len();
            if len <= budget {
                break;
            }
            if !prompt.history.is_empty() {
                prompt.history.remove(0);
                prompt.dropped_turns += 1;
            } else if prompt.context.pop().is_some() {
                prompt.dropped_chunks += 1;
            } else {
                return Err(Error::InvalidRequest(format!(
                    "query and instructions need {} characters but the prompt budget is {}",
                    len, budget
                )));
            }
        }

        debug!(
            "Assembled prompt: {} chars of {}, {} chunks, {} turns ({} turns and {} chunks dropped)",
            prompt.char_len(),
            budget,
            prompt.context.len(),
            prompt.history.len(),
            prompt.dropped_turns,
            prompt.dropped_chunks
        );
        Ok(prompt)
    }
}
