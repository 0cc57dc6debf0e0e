//! Data types for documents, chunks and index records.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use campuskb_core::Error;

/// Kind of source a document was ingested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Text,
    Markdown,
    /// Knowledge-base page given as structured JSON entries.
    StructuredPage,
    /// A PDF file, or text already extracted from one.
    Pdf,
    /// A Word (.docx) file.
    Docx,
    /// CSV table.
    Tabular,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::StructuredPage => "structured_page",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Tabular => "tabular",
        }
    }

    /// Source type implied by a file name's extension. Unknown extensions are text.
    pub fn from_file_name(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        ext.parse().unwrap_or(Self::Text)
    }
}

impl FromStr for SourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" | "txt" => Ok(Self::Text),
            "markdown" | "md" => Ok(Self::Markdown),
            "structured_page" | "json" => Ok(Self::StructuredPage),
            "pdf" => Ok(Self::Pdf),
            "docx" | "word" => Ok(Self::Docx),
            "tabular" | "csv" => Ok(Self::Tabular),
            other => Err(Error::InvalidRequest(format!("unknown source type: {other}"))),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short answers (FAQ entries) versus long-form pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentForm {
    Short,
    #[default]
    Long,
}

impl ContentForm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub form: ContentForm,
    /// Where the document came from (URL, file name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// An ingested document. Immutable once stored; retired by replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Documents sharing a logical key supersede each other.
    pub logical_key: String,
    pub source_type: SourceType,
    pub metadata: DocumentMetadata,
    pub content_hash: String,
    /// Normalized text the chunks were cut from.
    pub text: String,
    pub created_at: i64,
}

/// A retrieval-sized span of one document's normalized text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    /// Byte offsets into the document's normalized text.
    pub start: usize,
    pub end: usize,
    pub token_estimate: usize,
}

/// A chunk plus the provenance needed to cite it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRecord {
    pub chunk: Chunk,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A stored embedding with the model version that produced it.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub vector: ndarray::Array1<f32>,
    pub model_version: String,
}

/// A chunk loaded back from storage, with its embedding when one was stored.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub record: ChunkRecord,
    pub embedding: Option<StoredEmbedding>,
}

/// Listing entry for the document management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub logical_key: String,
    pub title: String,
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub chunk_count: usize,
    pub created_at: i64,
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_documents: usize,
    pub total_chunks: usize,
    pub embeddings_stored: usize,
    pub db_path: String,
    pub db_size_mb: f64,
}

/// SHA-256 of raw content, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Document id derived from its logical key and content, so re-ingesting the
/// same bytes under the same key always yields the same id.
pub fn document_id(logical_key: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(logical_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(content_hash.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

pub fn chunk_id(document_id: &str, ordinal: u32) -> String {
    format!("{}#{:04}", document_id, ordinal)
}
