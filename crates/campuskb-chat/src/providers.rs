//! HTTP calls to LLM providers.
//!
//! Completions are streamed over SSE. OpenAI and Groq (and any
//! OpenAI-compatible server) share one event format; Anthropic has its own.
//! The health probe lists models, which is cheap and needs a valid key.

use std::pin::Pin;

use futures::Stream;
use reqwest::{Client, RequestBuilder};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, error};

use crate::config::ResolvedProvider;
use crate::types::{ChatMessage, GenerationParams, LLMProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub type BoxedStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// A single streamed token, the end marker, or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Token(String),
    Done { tokens_used: usize },
    Error(String),
}

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Error(String),
}

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Default)]
struct SseLines {
    buffer: String,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn parse_openai(data: &str) -> Option<SseEvent> {
    if data.trim() == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let parsed: serde_json::Value = serde_json::from_str(data).ok()?;
    if let Some(msg) = parsed["error"]["message"].as_str() {
        return Some(SseEvent::Error(msg.to_string()));
    }
    parsed["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| SseEvent::Token(s.to_string()))
}

fn parse_anthropic(data: &str) -> Option<SseEvent> {
    let parsed: serde_json::Value = serde_json::from_str(data).ok()?;
    match parsed["type"].as_str()? {
        "content_block_delta" => parsed["delta"]["text"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| SseEvent::Token(s.to_string())),
        "message_stop" => Some(SseEvent::Done),
        "error" => Some(SseEvent::Error(
            parsed["error"]["message"]
                .as_str()
                .unwrap_or("unknown error")
                .to_string(),
        )),
        _ => None,
    }
}

fn with_auth(request: RequestBuilder, target: &ResolvedProvider) -> RequestBuilder {
    match target.provider {
        LLMProvider::Anthropic => request
            .header("x-api-key", &target.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION),
        LLMProvider::OpenAI | LLMProvider::Groq => {
            request.header("Authorization", format!("Bearer {}", target.api_key))
        }
    }
}

fn completion_request(
    client: &Client,
    target: &ResolvedProvider,
    messages: &[ChatMessage],
    params: GenerationParams,
) -> RequestBuilder {
    let body = match target.provider {
        LLMProvider::Anthropic => {
            let system: Option<&str> = messages
                .iter()
                .find(|m| m.role == "system")
                .map(|m| m.content.as_str());
            let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();
            let mut body = json!({
                "model": target.model,
                "messages": turns,
                "temperature": params.temperature,
                "max_tokens": params.max_tokens,
                "stream": true,
            });
            if let Some(system) = system {
                body["system"] = json!(system);
            }
            body
        }
        LLMProvider::OpenAI | LLMProvider::Groq => json!({
            "model": target.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": true,
        }),
    };
    let path = match target.provider {
        LLMProvider::Anthropic => "messages",
        LLMProvider::OpenAI | LLMProvider::Groq => "chat/completions",
    };
    with_auth(client.post(format!("{}/{}", target.base_url, path)), target).json(&body)
}

/// Stream tokens from the resolved provider.
pub fn stream_llm(
    client: &Client,
    target: &ResolvedProvider,
    messages: Vec<ChatMessage>,
    params: GenerationParams,
) -> BoxedStream {
    let request = completion_request(client, target, &messages, params);
    let parse: fn(&str) -> Option<SseEvent> = match target.provider {
        LLMProvider::Anthropic => parse_anthropic,
        LLMProvider::OpenAI | LLMProvider::Groq => parse_openai,
    };
    let provider = target.provider;
    let model = target.model.clone();

    Box::pin(async_stream::stream! {
        debug!("Streaming from {} with model {}", provider, model);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                yield StreamChunk::Error(format!("request failed: {}", e));
                return;
            }
        };
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            yield StreamChunk::Error(format!("API error {}: {}", status, body));
            return;
        }

        let mut bytes = response.bytes_stream();
        let mut lines = SseLines::default();
        let mut tokens_used = 0usize;

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield StreamChunk::Error(format!("stream read error: {}", e));
                    return;
                }
            };
            for data in lines.push(&chunk) {
                match parse(&data) {
                    Some(SseEvent::Token(text)) => {
                        tokens_used += 1;
                        yield StreamChunk::Token(text);
                    }
                    Some(SseEvent::Done) => {
                        yield StreamChunk::Done { tokens_used };
                        return;
                    }
                    Some(SseEvent::Error(msg)) => {
                        error!("{} stream error: {}", provider, msg);
                        yield StreamChunk::Error(msg);
                        return;
                    }
                    None => {}
                }
            }
        }

        yield StreamChunk::Done { tokens_used };
    })
}

/// Cheap authenticated GET against the provider's model list.
pub async fn check_health(client: &Client, target: &ResolvedProvider) -> Result<(), String> {
    let url = format!("{}/models", target.base_url);
    let response = with_auth(client.get(&url), target)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("{} returned status {}", url, response.status()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_lines_across_chunk_boundaries() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        let out = lines.push(b":1}\n\nevent: ping\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_parse_openai_events() {
        assert_eq!(
            parse_openai(r#"{"choices":[{"delta":{"content":"Labs"}}]}"#),
            Some(SseEvent::Token("Labs".into()))
        );
        assert_eq!(parse_openai(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(parse_openai("[DONE]"), Some(SseEvent::Done));
        assert_eq!(
            parse_openai(r#"{"error":{"message":"rate limited"}}"#),
            Some(SseEvent::Error("rate limited".into()))
        );
    }

    #[test]
    fn test_parse_anthropic_events() {
        assert_eq!(
            parse_anthropic(r#"{"type":"content_block_delta","delta":{"text":"Tuesday"}}"#),
            Some(SseEvent::Token("Tuesday".into()))
        );
        assert_eq!(parse_anthropic(r#"{"type":"ping"}"#), None);
        assert_eq!(parse_anthropic(r#"{"type":"message_stop"}"#), Some(SseEvent::Done));
        assert_eq!(parse_anthropic("not json"), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_yields_error_chunk() {
        let target = ResolvedProvider {
            provider: LLMProvider::OpenAI,
            model: "local".into(),
            api_key: "k".into(),
            base_url: "http://127.0.0.1:9".into(),
        };
        let client = Client::new();
        let mut stream = stream_llm(
            &client,
            &target,
            vec![ChatMessage::new("user", "hi")],
            GenerationParams {
                temperature: 0.2,
                max_tokens: 8,
            },
        );
        assert!(matches!(stream.next().await, Some(StreamChunk::Error(_))));
        assert!(check_health(&client, &target).await.is_err());
    }
}
