//! CampusKB Ingest — source normalization, chunking, document ingestion.

pub mod chunking;
pub mod document;
pub mod extract;
pub mod ingest;
pub mod normalize;

pub use chunking::Chunker;
pub use document::{logical_key, DocumentInput};
pub use ingest::{IngestFailure, Ingester, PreparedBatch, PreparedDocument};
