//! The chat pipeline: gate -> retrieve -> assemble -> generate.
//!
//! Every failure is caught here and turned into a `ChatOutcome`. Backend
//! failures become one user-visible degraded message; the detail goes to
//! the logs only. Generation is retried at most once, with the assembler's
//! smaller retry budget.
//!
//! Capability routing runs before retrieval: math the persona may solve is
//! answered locally, and code questions skip the campus index.
//!
//! A turn holds its session lock from the first read of history until the
//! reply is appended. Nothing is appended unless the turn is answered, so a
//! cancelled or degraded turn leaves the session as it was, and a session
//! created for a failed turn is released again.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use campuskb_chat::capabilities::{self, Capability, CodeQuestion, MathSolution};
use campuskb_chat::persona::temperature;
use campuskb_chat::{
    ChatRequest, ChatResponse, ContextAssembler, Generation, GenerationParams, Prompt,
    ResponseGenerator,
};
use campuskb_core::{AppConfig, Error, Message, PersonaCatalog, PersonaConfig};
use campuskb_retrieve::{RetrievalResult, Retriever, SourceRef};

use crate::gate::{AvailabilityGate, GateState};
use crate::session::SessionRegistry;
use crate::stats::PipelineStats;

pub const DEGRADED_MESSAGE: &str =
    "The campus assistant backend is unavailable right now. Please try again later.";

const MAX_SOURCES: usize = 3;
const MAX_TOP_K: usize = 50;
/// Model name reported for locally solved math.
pub const MATH_MODEL: &str = "math-solver";

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub response: String,
    pub sources: Vec<SourceRef>,
    pub grounded: bool,
    pub conversation_id: String,
    pub model: String,
    /// The answer came from the shortened retry prompt.
    pub retried: bool,
}

/// One turn's inputs, shared by the first attempt and the retry.
struct Turn<'a> {
    message: &'a str,
    history: &'a [Message],
    persona: &'a PersonaConfig,
    code: Option<&'a CodeQuestion>,
}

struct Response {
    generation: Generation,
    retrieval: RetrievalResult,
    retried: bool,
}

enum Failure {
    Degraded,
    Rejected(Error),
}

#[derive(Debug)]
pub enum ChatOutcome {
    Answered(ChatReply),
    /// Backend unavailable; the caller shows `DEGRADED_MESSAGE`.
    Degraded { conversation_id: String },
    /// The request itself is invalid.
    Rejected(Error),
}

impl ChatOutcome {
    /// Wire shape of the outcome. Only a rejected request is an error.
    pub fn into_chat_response(self) -> Result<ChatResponse, Error> {
        match self {
            ChatOutcome::Answered(reply) => Ok(ChatResponse {
                response: reply.response,
                sources: reply.sources,
                grounded: reply.grounded,
                conversation_id: reply.conversation_id,
                degraded: false,
            }),
            ChatOutcome::Degraded { conversation_id } => Ok(ChatResponse {
                response: DEGRADED_MESSAGE.to_string(),
                sources: Vec::new(),
                grounded: false,
                conversation_id,
                degraded: true,
            }),
            ChatOutcome::Rejected(e) => Err(e),
        }
    }
}

pub struct Pipeline {
    gate: Arc<AvailabilityGate>,
    retriever: Arc<Retriever>,
    assembler: ContextAssembler,
    generator: Arc<dyn ResponseGenerator>,
    sessions: Arc<SessionRegistry>,
    personas: PersonaCatalog,
    stats: PipelineStats,
    top_k: usize,
    max_tokens: usize,
}

impl Pipeline {
    pub fn new(
        gate: Arc<AvailabilityGate>,
        retriever: Arc<Retriever>,
        generator: Arc<dyn ResponseGenerator>,
        sessions: Arc<SessionRegistry>,
        personas: PersonaCatalog,
        config: &AppConfig,
    ) -> Self {
        Self {
            gate,
            retriever,
            assembler: ContextAssembler::new(config.assembly.clone()),
            generator,
            sessions,
            personas,
            stats: PipelineStats::new(),
            top_k: config.retrieval.top_k,
            max_tokens: config.generation.max_tokens,
        }
    }

    pub fn gate(&self) -> &Arc<AvailabilityGate> {
        &self.gate
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn retriever(&self) -> &Arc<Retriever> {
        &self.retriever
    }

    /// Handle one inbound query.
    ///
    /// Validation and the ownership check come first; only requests that pass
    /// them are counted. A math question the persona can solve is answered
    /// without a backend. Everything else needs the gate to be open before a
    /// session is created or seeded, and a turn that fails leaves no session
    /// behind.
    pub async fn chat(&self, request: ChatRequest) -> ChatOutcome {
        let message = request.message.trim();
        if message.is_empty() {
            return self.reject(Error::InvalidRequest("message must not be empty".into()));
        }
        let k = match request.options.top_k {
            Some(0) => return self.reject(Error::InvalidRequest("top_k must be positive".into())),
            Some(k) => k.min(MAX_TOP_K),
            None => self.top_k,
        };

        let options = &request.options;
        let user_id = options.user_id.as_deref();
        let conversation_id = match options.conversation_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if let Err(e) = self.sessions.check_owner(&conversation_id, user_id) {
            return self.reject(e);
        }
        self.stats.record_query();

        let persona = self.personas.resolve(&options.persona);
        let code = match capabilities::route(message, &persona.integrations) {
            Some(Capability::Math(solution)) => {
                return self.answer_math(message, solution, &conversation_id, &request).await;
            }
            Some(Capability::Code(question)) => Some(question),
            None => None,
        };

        if self.gate.check().await == GateState::Unavailable {
            info!("Backend unavailable, short-circuiting query on {}", conversation_id);
            return self.degraded(conversation_id);
        }

        let handle = match self.sessions.open(Some(conversation_id.as_str()), user_id) {
            Ok(handle) => handle,
            Err(e) => return self.reject(e),
        };
        let mut session = handle.lock().await;
        let history = if session.is_empty() {
            request.history.clone()
        } else {
            session.history().to_vec()
        };

        let turn = Turn {
            message,
            history: &history,
            persona: &persona,
            code: code.as_ref(),
        };
        let reply = match self.respond(&turn, k).await {
            Ok(reply) => reply,
            Err(failure) => {
                drop(session);
                self.sessions.release(handle);
                return match failure {
                    Failure::Degraded => self.degraded(conversation_id),
                    Failure::Rejected(e) => self.reject(e),
                };
            }
        };

        if session.seed(&request.history) {
            debug!(
                "Seeded conversation {} with {} client turns",
                conversation_id,
                request.history.len()
            );
        }
        session.append(Message::user(message));
        session.append(Message::assistant(reply.generation.text.clone()));
        drop(session);

        let grounded = reply.retrieval.is_grounded();
        if code.is_some() {
            self.stats.record_capability();
        } else {
            self.stats.record_answer(grounded);
        }
        info!(
            "Answered on {} (grounded={}, chunks={}, model={}, retried={}, code={})",
            conversation_id,
            grounded,
            reply.retrieval.len(),
            reply.generation.model,
            reply.retried,
            code.is_some()
        );

        ChatOutcome::Answered(ChatReply {
            response: reply.generation.text,
            sources: reply.retrieval.sources(MAX_SOURCES),
            grounded,
            conversation_id,
            model: reply.generation.model,
            retried: reply.retried,
        })
    }

    /// Retrieve (unless the turn is a code question), assemble and generate
    /// with one shorter retry.
    async fn respond(&self, turn: &Turn<'_>, k: usize) -> Result<Response, Failure> {
        let retrieval = if turn.code.is_some() {
            RetrievalResult::empty()
        } else {
            let started = Instant::now();
            let retrieval = self
                .retriever
                .retrieve(turn.message, turn.history, k)
                .map_err(|e| {
                    warn!("Retrieval failed: {}", e);
                    self.gate.mark_unavailable(&e.to_string());
                    Failure::Degraded
                })?;
            self.stats.record_retrieval(started.elapsed(), retrieval.cached);
            retrieval
        };

        let params = GenerationParams {
            temperature: temperature(turn.persona),
            max_tokens: self.max_tokens,
        };
        let prompt = self
            .assemble(turn, &retrieval, false)
            .map_err(Failure::Rejected)?;

        let (generation, retried) = match self.generator.generate(&prompt, params).await {
            Ok(generation) => (generation, false),
            Err(first) => {
                warn!("Generation failed ({}), retrying with a shorter prompt", first);
                self.stats.record_retry();
                match self.retry(turn, &retrieval, params).await {
                    Some(generation) => (generation, true),
                    None => {
                        self.gate.mark_unavailable(&first.to_string());
                        return Err(Failure::Degraded);
                    }
                }
            }
        };

        Ok(Response {
            generation,
            retrieval,
            retried,
        })
    }

    /// Math answers need no backend; the turn is still recorded.
    async fn answer_math(
        &self,
        message: &str,
        solution: MathSolution,
        conversation_id: &str,
        request: &ChatRequest,
    ) -> ChatOutcome {
        let handle = match self
            .sessions
            .open(Some(conversation_id), request.options.user_id.as_deref())
        {
            Ok(handle) => handle,
            Err(e) => return self.reject(e),
        };
        let response = solution.render();
        {
            let mut session = handle.lock().await;
            session.seed(&request.history);
            session.append(Message::user(message));
            session.append(Message::assistant(response.clone()));
        }

        self.stats.record_capability();
        info!("Solved '{}' locally on {}", solution.expression, conversation_id);
        ChatOutcome::Answered(ChatReply {
            response,
            sources: Vec::new(),
            grounded: false,
            conversation_id: conversation_id.to_string(),
            model: MATH_MODEL.to_string(),
            retried: false,
        })
    }

    async fn retry(
        &self,
        turn: &Turn<'_>,
        retrieval: &RetrievalResult,
        params: GenerationParams,
    ) -> Option<Generation> {
        let prompt = match self.assemble(turn, retrieval, true) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Retry prompt does not fit: {}", e);
                return None;
            }
        };
        match self.generator.generate(&prompt, params).await {
            Ok(generation) => Some(generation),
            Err(e) => {
                warn!("Generation retry failed: {}", e);
                None
            }
        }
    }

    fn assemble(
        &self,
        turn: &Turn<'_>,
        retrieval: &RetrievalResult,
        retry: bool,
    ) -> campuskb_core::Result<Prompt> {
        let budget = if retry {
            self.assembler.retry_budget()
        } else {
            self.assembler.budget()
        };
        match turn.code {
            Some(question) => self.assembler.assemble_code(
                turn.message,
                question.language,
                turn.history,
                turn.persona,
                budget,
            ),
            None => self.assembler.assemble(
                turn.message,
                retrieval,
                turn.history,
                turn.persona,
                budget,
            ),
        }
    }

    fn degraded(&self, conversation_id: String) -> ChatOutcome {
        self.stats.record_degraded();
        ChatOutcome::Degraded { conversation_id }
    }

    fn reject(&self, e: Error) -> ChatOutcome {
        debug!("Rejected chat request: {}", e);
        self.stats.record_rejected();
        ChatOutcome::Rejected(e)
    }
}
