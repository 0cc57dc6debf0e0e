//! CampusKB Store — in-memory embedding index plus the SQLite corpus it is rebuilt from.

pub mod embedding;
pub mod index;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use index::{EmbeddingIndex, IndexEntry, Neighbor};
pub use sqlite::CorpusStore;
pub use types::*;
