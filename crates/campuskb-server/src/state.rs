//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::info;

use campuskb_chat::{LLMConfig, LlmGenerator, ResponseGenerator};
use campuskb_core::{AppConfig, PersonaCatalog, Result};
use campuskb_infer::{create_embedder, EmbedderBackend};
use campuskb_retrieve::Retriever;
use campuskb_runtime::{
    AvailabilityGate, Clock, HealthProbe, KnowledgeBase, LlmHealthProbe, Pipeline,
    SessionRegistry, SystemClock,
};
use campuskb_store::{CorpusStore, EmbeddingIndex};

/// Backend seams the state is wired with. Tests swap in fakes.
pub struct Backends {
    pub embedder: Arc<dyn EmbedderBackend>,
    pub probe: Arc<dyn HealthProbe>,
    pub clock: Arc<dyn Clock>,
    pub generator: Arc<dyn ResponseGenerator>,
}

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: AppConfig,
    pub knowledge: KnowledgeBase,
    pub pipeline: Pipeline,
    pub llm_config: Arc<RwLock<LLMConfig>>,
    started_at: Instant,
}

impl AppState {
    /// Production wiring: hashing embedder, LLM-backed generator and probe.
    pub fn open(config: AppConfig) -> Result<Self> {
        let llm_config = Arc::new(RwLock::new(LLMConfig::load(
            &config.data_paths.llm_config_file,
        )));
        let backends = Backends {
            embedder: create_embedder(&config.index),
            probe: Arc::new(LlmHealthProbe::new(llm_config.clone())),
            clock: Arc::new(SystemClock),
            generator: Arc::new(LlmGenerator::new(
                llm_config.clone(),
                config.generation.timeout,
            )),
        };
        Self::with_backends(config, llm_config, backends)
    }

    pub fn with_backends(
        config: AppConfig,
        llm_config: Arc<RwLock<LLMConfig>>,
        backends: Backends,
    ) -> Result<Self> {
        config.validate()?;
        let paths = &config.data_paths;

        let store = Arc::new(CorpusStore::open(&paths.corpus)?);
        let index = Arc::new(EmbeddingIndex::new(
            config.index.embedding_dim,
            config.index.metric,
        ));
        let knowledge = KnowledgeBase::new(
            store,
            index.clone(),
            backends.embedder.clone(),
            config.chunking.clone(),
        )?;
        knowledge.load()?;

        let retriever = Arc::new(Retriever::new(
            index,
            backends.embedder,
            config.retrieval.clone(),
        ));
        let gate = Arc::new(AvailabilityGate::new(
            backends.probe,
            backends.clock.clone(),
            config.gate.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::load(
            &paths.conversations_file,
            config.sessions.clone(),
            backends.clock,
        )?);
        let personas = PersonaCatalog::load(&paths.personas_file)?;

        let pipeline = Pipeline::new(
            gate,
            retriever,
            backends.generator,
            sessions,
            personas,
            &config,
        );

        Ok(Self {
            config,
            knowledge,
            pipeline,
            llm_config,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Persist conversation memory; called on graceful shutdown.
    pub async fn save_conversations(&self) -> Result<usize> {
        let saved = self
            .pipeline
            .sessions()
            .save(&self.config.data_paths.conversations_file)
            .await?;
        info!("Conversation memory saved ({} sessions)", saved);
        Ok(saved)
    }
}
