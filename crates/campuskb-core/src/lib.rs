//! CampusKB Core — error taxonomy, configuration, personas, shared text utilities.

pub mod config;
pub mod error;
pub mod message;
pub mod persona;
pub mod text;

pub use config::{
    AppConfig, AssemblyConfig, ChunkingConfig, DataPaths, DistanceMetric, GateConfig,
    GenerationConfig, IndexConfig, RetrievalConfig, SessionConfig,
};
pub use error::{Error, Result};
pub use message::{Message, Role};
pub use persona::{
    IntegrationToggles, PersonaCatalog, PersonaConfig, PersonaId, PersonaOverrides, TraitWeight,
    TraitWeights, VoiceStyle,
};
