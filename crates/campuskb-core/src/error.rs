//! Error types for CampusKB.
//!
//! One variant per failure class of the retrieval pipeline. "No grounding
//! found" is deliberately absent: an empty retrieval result is a valid state.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unparseable source document. Batch-local, never fatal.
    #[error("Document format error in {document}: {reason}")]
    DocumentFormat { document: String, reason: String },

    /// The vector index (or the embedder feeding it) cannot serve queries.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("Generation backend unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn document_format(document: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DocumentFormat {
            document: document.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable kind, used in typed error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DocumentFormat { .. } => "document_format",
            Self::IndexUnavailable(_) => "index_unavailable",
            Self::GenerationTimeout(_) => "generation_timeout",
            Self::GenerationUnavailable(_) => "generation_unavailable",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Storage(_) => "storage",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
