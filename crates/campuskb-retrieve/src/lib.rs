//! CampusKB Retrieve — ranked, deduplicated chunk retrieval.

pub mod retriever;
pub mod types;

pub use retriever::Retriever;
pub use types::{RetrievalResult, RetrievedChunk, SourceRef};
