//! CampusKB runtime: everything between an HTTP request and the retrieval core.
//!
//! - [`AvailabilityGate`]: cached backend health with bounded staleness.
//! - [`SessionRegistry`]: per-conversation history, one writer at a time.
//! - [`KnowledgeBase`]: ingestion, deletion and rebuilds over store + index.
//! - [`Pipeline`]: capability routing, then gate -> retrieve -> assemble ->
//!   generate, with one retry.

pub mod clock;
pub mod gate;
pub mod knowledge;
pub mod orchestrator;
pub mod session;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::{AvailabilityGate, GateSnapshot, GateState, HealthProbe, LlmHealthProbe};
pub use knowledge::{IngestSummary, KnowledgeBase, LoadSummary, RebuildSummary};
pub use orchestrator::{ChatOutcome, ChatReply, Pipeline, DEGRADED_MESSAGE, MATH_MODEL};
pub use session::{ConversationSession, SessionRegistry};
pub use stats::{PipelineStats, StatsSnapshot};
