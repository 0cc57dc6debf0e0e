//! Chat types: prompts, generation results and the inbound/outbound API shapes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use campuskb_core::{Error, Message, PersonaOverrides};
use campuskb_retrieve::SourceRef;

/// LLM provider identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    OpenAI,
    Anthropic,
    Groq,
}

impl LLMProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            LLMProvider::OpenAI => "openai",
            LLMProvider::Anthropic => "anthropic",
            LLMProvider::Groq => "groq",
        }
    }
}

impl std::fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level chat message sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// A grounding chunk as it appears in the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextItem {
    /// 1-based provenance marker, in retrieval rank order.
    pub rank: usize,
    pub title: String,
    pub source: Option<String>,
    pub text: String,
    pub score: f32,
}

impl ContextItem {
    pub fn render(&self) -> String {
        match &self.source {
            Some(source) => format!("[{}] {} ({})\n{}", self.rank, self.title, source, self.text),
            None => format!("[{}] {}\n{}", self.rank, self.title, self.text),
        }
    }
}

/// An assembled, budget-bounded prompt.
///
/// Section order: system instructions, grounding block, history window,
/// current query.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub context: Vec<ContextItem>,
    pub history: Vec<Message>,
    pub query: String,
    /// Budget the prompt was assembled under, in characters.
    pub budget: usize,
    pub dropped_turns: usize,
    pub dropped_chunks: usize,
}

pub(crate) const CONTEXT_HEADER: &str = "Reference material:";

impl Prompt {
    pub fn is_grounded(&self) -> bool {
        !self.context.is_empty()
    }

    /// System message content: instructions followed by the grounding block.
    pub fn system_content(&self) -> String {
        if self.context.is_empty() {
            return self.system.clone();
        }
        let block = self
            .context
            .iter()
            .map(ContextItem::render)
            .collect::<Vec<_>>()
            .join("\n\n");
        format!("{}\n\n{}\n{}", self.system, CONTEXT_HEADER, block)
    }

    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::new("system", self.system_content()));
        for turn in &self.history {
            messages.push(ChatMessage::new(turn.role.as_str(), turn.content.clone()));
        }
        messages.push(ChatMessage::new("user", self.query.clone()));
        messages
    }

    /// Total characters across all message contents.
    pub fn char_len(&self) -> usize {
        self.to_messages()
            .iter()
            .map(|m| m.content.chars().count())
            .sum()
    }
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub max_tokens: usize,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub tokens_used: usize,
}

/// Typed generation failure. The orchestrator decides whether to retry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation backend unavailable: {0}")]
    Unavailable(String),
}

impl From<GenerationError> for Error {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Timeout(d) => Error::GenerationTimeout(d),
            GenerationError::Unavailable(msg) => Error::GenerationUnavailable(msg),
        }
    }
}

/// Inbound query: `{message, history?, options?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, alias = "conversationHistory")]
    pub history: Vec<Message>,
    #[serde(default)]
    pub options: ChatOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatOptions {
    #[serde(flatten)]
    pub persona: PersonaOverrides,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    #[serde(default, alias = "topK")]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub grounded: bool,
    pub conversation_id: String,
    pub degraded: bool,
}

/// Typed error payload: `{error: {kind, message}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind: kind.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn from_error(e: &Error) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// LLM config as shown to clients (keys masked).
#[derive(Debug, Clone, Serialize)]
pub struct LLMConfigResponse {
    pub preferred_provider: String,
    pub openai_configured: bool,
    pub anthropic_configured: bool,
    pub groq_configured: bool,
    pub openai_model: String,
    pub anthropic_model: String,
    pub groq_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub active_provider: Option<String>,
    pub available_models: Vec<String>,
}

/// Partial LLM config update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LLMConfigUpdate {
    #[serde(default, alias = "preferredProvider")]
    pub preferred_provider: Option<String>,
    #[serde(default, alias = "openaiApiKey")]
    pub openai_api_key: Option<String>,
    #[serde(default, alias = "anthropicApiKey")]
    pub anthropic_api_key: Option<String>,
    #[serde(default, alias = "groqApiKey")]
    pub groq_api_key: Option<String>,
    #[serde(default, alias = "openaiModel")]
    pub openai_model: Option<String>,
    #[serde(default, alias = "anthropicModel")]
    pub anthropic_model: Option<String>,
    #[serde(default, alias = "groqModel")]
    pub groq_model: Option<String>,
    #[serde(default, alias = "baseUrl")]
    pub base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use campuskb_core::{PersonaId, Role};

    #[test]
    fn test_chat_request_options() {
        let req: ChatRequest = serde_json::from_str(
            r#"{
                "message": "when do labs start",
                "history": [{"role": "user", "content": "hi"}, {"role": "assistant", "content": "hello"}],
                "options": {"persona": "faculty", "conversationId": "c1", "voice_style": "concise"}
            }"#,
        )
        .unwrap();
        assert_eq!(req.history.len(), 2);
        assert_eq!(req.history[1].role, Role::Assistant);
        assert_eq!(req.options.persona.persona, Some(PersonaId::Faculty));
        assert_eq!(req.options.conversation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_out_of_range_trait_rejected() {
        let parsed: Result<ChatRequest, _> = serde_json::from_str(
            r#"{"message": "hi", "options": {"traits": {"creativity": 140}}}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_prompt_messages_order() {
        let prompt = Prompt {
            system: "Be helpful.".into(),
            context: vec![ContextItem {
                rank: 1,
                title: "Calendar".into(),
                source: Some("registrar".into()),
                text: "Labs start Tuesday.".into(),
                score: 0.9,
            }],
            history: vec![Message::user("hi"), Message::assistant("hello")],
            query: "when do labs start".into(),
            budget: 1000,
            dropped_turns: 0,
            dropped_chunks: 0,
        };
        let messages = prompt.to_messages();
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert!(messages[0].content.contains("[1] Calendar (registrar)\nLabs start Tuesday."));
        assert_eq!(messages[3].content, "when do labs start");
        assert_eq!(
            prompt.char_len(),
            messages.iter().map(|m| m.content.chars().count()).sum::<usize>()
        );
    }

    #[test]
    fn test_generation_error_into_core_error() {
        let e: Error = GenerationError::Timeout(Duration::from_secs(30)).into();
        assert_eq!(e.kind(), "generation_timeout");
        let body = ErrorBody::from_error(&Error::InvalidRequest("empty message".into()));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["kind"], "invalid_request");
    }
}
