//! Response generation behind a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use reqwest::Client;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::config::LLMConfig;
use crate::extractive::ExtractiveGenerator;
use crate::providers::{self, StreamChunk};
use crate::types::{Generation, GenerationError, GenerationParams, Prompt};

/// Produces a reply for an assembled prompt.
///
/// Implementations must return within their own bounded timeout and report
/// failures as `GenerationError`; they never retry.
pub trait ResponseGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        prompt: &'a Prompt,
        params: GenerationParams,
    ) -> BoxFuture<'a, Result<Generation, GenerationError>>;
}

/// Calls the configured LLM provider.
///
/// When no provider is configured, answers come from the extractive
/// generator so the service stays usable offline.
pub struct LlmGenerator {
    client: Client,
    config: Arc<RwLock<LLMConfig>>,
    timeout: Duration,
    fallback: ExtractiveGenerator,
}

impl LlmGenerator {
    pub fn new(config: Arc<RwLock<LLMConfig>>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            config,
            timeout,
            fallback: ExtractiveGenerator::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, prompt: &Prompt, params: GenerationParams) -> Result<Generation, GenerationError> {
        let target = self.config.read().resolve_provider();
        let Some(target) = target else {
            debug!("No LLM provider configured, answering extractively");
            return self.fallback.generate(prompt, params).await;
        };

        let mut stream = providers::stream_llm(&self.client, &target, prompt.to_messages(), params);
        let collect = async {
            let mut text = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    StreamChunk::Token(t) => text.push_str(&t),
                    StreamChunk::Done { tokens_used } => {
                        return Ok(Generation {
                            text,
                            model: target.model.clone(),
                            tokens_used,
                        });
                    }
                    StreamChunk::Error(e) => return Err(GenerationError::Unavailable(e)),
                }
            }
            Err(GenerationError::Unavailable("stream ended without completion".into()))
        };

        match tokio::time::timeout(self.timeout, collect).await {
            Ok(Ok(generation)) if generation.text.trim().is_empty() => {
                Err(GenerationError::Unavailable("empty completion".into()))
            }
            Ok(result) => result,
            Err(_) => {
                warn!("{} generation timed out after {:?}", target.provider, self.timeout);
                Err(GenerationError::Timeout(self.timeout))
            }
        }
    }
}

impl ResponseGenerator for LlmGenerator {
    fn generate<'a>(
        &'a self,
        prompt: &'a Prompt,
        params: GenerationParams,
    ) -> BoxFuture<'a, Result<Generation, GenerationError>> {
        Box::pin(self.run(prompt, params))
    }
}
