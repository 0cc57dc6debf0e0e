//! Configuration and data directory management.
//!
//! Every tunable has a default and may be overridden through a `CAMPUSKB_*`
//! environment variable. `AppConfig::validate` is the single gate through
//! which configuration enters the pipeline.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Paths to all CampusKB data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Corpus database directory (`data/corpus/`).
    pub corpus: PathBuf,
    /// LLM configuration (`data/llm-config.json`).
    pub llm_config_file: PathBuf,
    /// Persona catalog (`data/personas.json`).
    pub personas_file: PathBuf,
    /// Conversation snapshot (`data/conversations.json`).
    pub conversations_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            corpus: root.join("corpus"),
            llm_config_file: root.join("llm-config.json"),
            personas_file: root.join("personas.json"),
            conversations_file: root.join("conversations.json"),
            root,
        };
        std::fs::create_dir_all(&paths.corpus)?;
        Ok(paths)
    }
}

/// Distance metric of an embedding index. Fixed for the lifetime of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
}

impl FromStr for DistanceMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "euclidean" | "l2" => Ok(Self::Euclidean),
            other => Err(Error::InvalidConfig(format!("unknown distance metric: {other}"))),
        }
    }
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cosine => write!(f, "cosine"),
            Self::Euclidean => write!(f, "euclidean"),
        }
    }
}

/// Chunk window, in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    /// Upper bound on text shared by two consecutive chunks of one document.
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: 80,
            max_chars: 600,
            overlap_chars: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub embedding_dim: usize,
    pub metric: DistanceMetric,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            metric: DistanceMetric::Cosine,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of chunks returned to the assembler.
    pub top_k: usize,
    /// Nearest-neighbour fetch is `top_k * oversample` to leave room for filtering.
    pub oversample: usize,
    /// Cap on chunks taken from any single document.
    pub max_chunks_per_document: usize,
    /// Weight of keyword overlap in the combined score, 0.0..=1.0.
    pub lexical_weight: f32,
    /// Combined score below which a chunk never counts as grounding.
    pub min_relevance: f32,
    /// Number of recent user turns folded into the query embedding.
    pub expansion_turns: usize,
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            oversample: 4,
            max_chunks_per_document: 2,
            lexical_weight: 0.35,
            min_relevance: 0.15,
            expansion_turns: 2,
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Hard prompt budget in characters.
    pub budget_chars: usize,
    /// Retry budget as a fraction of `budget_chars`; always strictly smaller.
    pub retry_budget_ratio: f32,
    /// Retention window: only this many most recent turns are considered.
    pub max_history_turns: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            budget_chars: 6000,
            retry_budget_ratio: 0.6,
            max_history_turns: 20,
        }
    }
}

impl AssemblyConfig {
    /// Budget for the single retry after a failed generation.
    pub fn retry_budget(&self) -> usize {
        let scaled = (self.budget_chars as f32 * self.retry_budget_ratio).floor() as usize;
        scaled.min(self.budget_chars.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_tokens: 1024,
        }
    }
}

/// Availability gate constants. The 2s probe timeout and 30s validity window
/// are load-bearing for the health interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub validity: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            validity: Duration::from_secs(30),
        }
    }
}

/// Conversation retention in the session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions untouched for this long are evicted.
    #[serde(with = "duration_secs")]
    pub idle_ttl: Duration,
    /// Upper bound on live sessions; the least recently used idle ones go first.
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(24 * 60 * 60),
            max_sessions: 1000,
        }
    }
}

/// Top-level CampusKB configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server port.
    pub port: u16,
    pub data_paths: DataPaths,
    pub chunking: ChunkingConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub assembly: AssemblyConfig,
    pub generation: GenerationConfig,
    pub gate: GateConfig,
    pub sessions: SessionConfig,
}

impl AppConfig {
    /// Defaults rooted at `data_dir`, without reading the environment.
    pub fn with_defaults(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            port: 3003,
            data_paths: DataPaths::new(data_dir)?,
            chunking: ChunkingConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            assembly: AssemblyConfig::default(),
            generation: GenerationConfig::default(),
            gate: GateConfig::default(),
            sessions: SessionConfig::default(),
        })
    }

    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::with_defaults(data_dir)?;

        config.port = env_or("PORT", config.port);

        let c = &mut config.chunking;
        c.min_chars = env_or("CAMPUSKB_CHUNK_MIN_CHARS", c.min_chars);
        c.max_chars = env_or("CAMPUSKB_CHUNK_MAX_CHARS", c.max_chars);
        c.overlap_chars = env_or("CAMPUSKB_CHUNK_OVERLAP_CHARS", c.overlap_chars);

        let i = &mut config.index;
        i.embedding_dim = env_or("CAMPUSKB_EMBEDDING_DIM", i.embedding_dim);
        i.metric = env_or("CAMPUSKB_DISTANCE_METRIC", i.metric);

        let r = &mut config.retrieval;
        r.top_k = env_or("CAMPUSKB_TOP_K", r.top_k);
        r.oversample = env_or("CAMPUSKB_OVERSAMPLE", r.oversample);
        r.max_chunks_per_document = env_or("CAMPUSKB_MAX_CHUNKS_PER_DOC", r.max_chunks_per_document);
        r.lexical_weight = env_or("CAMPUSKB_LEXICAL_WEIGHT", r.lexical_weight);
        r.min_relevance = env_or("CAMPUSKB_MIN_RELEVANCE", r.min_relevance);
        r.expansion_turns = env_or("CAMPUSKB_EXPANSION_TURNS", r.expansion_turns);
        r.cache_ttl = env_secs("CAMPUSKB_RETRIEVAL_CACHE_TTL_SECS", r.cache_ttl);

        let a = &mut config.assembly;
        a.budget_chars = env_or("CAMPUSKB_PROMPT_BUDGET_CHARS", a.budget_chars);
        a.retry_budget_ratio = env_or("CAMPUSKB_RETRY_BUDGET_RATIO", a.retry_budget_ratio);
        a.max_history_turns = env_or("CAMPUSKB_MAX_HISTORY_TURNS", a.max_history_turns);

        let g = &mut config.generation;
        g.timeout = env_secs("CAMPUSKB_GENERATION_TIMEOUT_SECS", g.timeout);
        g.max_tokens = env_or("CAMPUSKB_MAX_TOKENS", g.max_tokens);

        config.gate.probe_timeout = env_secs("CAMPUSKB_HEALTH_TIMEOUT_SECS", config.gate.probe_timeout);
        config.gate.validity = env_secs("CAMPUSKB_HEALTH_TTL_SECS", config.gate.validity);

        let s = &mut config.sessions;
        s.idle_ttl = env_secs("CAMPUSKB_SESSION_IDLE_TTL_SECS", s.idle_ttl);
        s.max_sessions = env_or("CAMPUSKB_MAX_SESSIONS", s.max_sessions);

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break pipeline invariants.
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.max_chars == 0 || c.min_chars > c.max_chars {
            return Err(Error::InvalidConfig(format!(
                "chunk window must satisfy 0 < min ({}) <= max ({})",
                c.min_chars, c.max_chars
            )));
        }
        if c.overlap_chars >= c.max_chars {
            return Err(Error::InvalidConfig(format!(
                "chunk overlap ({}) must be smaller than max chunk size ({})",
                c.overlap_chars, c.max_chars
            )));
        }
        if self.index.embedding_dim == 0 {
            return Err(Error::InvalidConfig("embedding dimension must be positive".into()));
        }
        let r = &self.retrieval;
        if r.top_k == 0 || r.max_chunks_per_document == 0 {
            return Err(Error::InvalidConfig(
                "top_k and max_chunks_per_document must be positive".into(),
            ));
        }
        // The per-document cap needs more candidates than it keeps.
        if r.oversample < 2 {
            return Err(Error::InvalidConfig(format!(
                "oversample ({}) must be at least 2",
                r.oversample
            )));
        }
        if !(0.0..=1.0).contains(&r.lexical_weight) {
            return Err(Error::InvalidConfig(format!(
                "lexical weight {} outside 0.0..=1.0",
                r.lexical_weight
            )));
        }
        let a = &self.assembly;
        if a.budget_chars == 0 || !(0.0..1.0).contains(&a.retry_budget_ratio) {
            return Err(Error::InvalidConfig(
                "prompt budget must be positive and retry ratio within 0.0..1.0".into(),
            ));
        }
        if self.gate.validity.is_zero() || self.gate.probe_timeout.is_zero() {
            return Err(Error::InvalidConfig("gate durations must be non-zero".into()));
        }
        if self.sessions.max_sessions == 0 || self.sessions.idle_ttl.is_zero() {
            return Err(Error::InvalidConfig(
                "session capacity and idle ttl must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparseable {}={}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs_f64(env_or(key, default.as_secs_f64()))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> (AppConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::with_defaults(dir.path()).unwrap();
        (config, dir)
    }

    #[test]
    fn test_defaults_are_valid() {
        let (config, dir) = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.gate.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.gate.validity, Duration::from_secs(30));
        assert!(dir.path().join("corpus").is_dir());
    }

    #[test]
    fn test_overlap_must_be_below_max() {
        let (mut config, _dir) = config();
        config.chunking.overlap_chars = config.chunking.max_chars;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_lexical_weight_range() {
        let (mut config, _dir) = config();
        config.retrieval.lexical_weight = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversample_must_exceed_one() {
        let (mut config, _dir) = config();
        config.retrieval.oversample = 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        config.retrieval.oversample = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_limits_positive() {
        let (mut config, _dir) = config();
        config.sessions.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_budget_strictly_smaller() {
        let mut assembly = AssemblyConfig::default();
        assert_eq!(assembly.retry_budget(), 3600);

        assembly.budget_chars = 1;
        assembly.retry_budget_ratio = 0.99;
        assert_eq!(assembly.retry_budget(), 0);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("COSINE".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("l2".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
