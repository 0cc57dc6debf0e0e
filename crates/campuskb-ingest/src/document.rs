//! Raw documents as they arrive for ingestion.

use serde::{Deserialize, Deserializer};

use campuskb_core::{Error, Result};
use campuskb_store::{ContentForm, DocumentMetadata, SourceType};

/// A source document before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentInput {
    /// Explicit logical key. Falls back to a slug of the title.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_source_type")]
    pub source_type: SourceType,
    #[serde(rename = "content", deserialize_with = "text_payload")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub form: Option<ContentForm>,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_source_type() -> SourceType {
    SourceType::Text
}

fn text_payload<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
    String::deserialize(d).map(String::into_bytes)
}

impl DocumentInput {
    pub fn new(source_type: SourceType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            source_type,
            payload: payload.into(),
            title: None,
            category: None,
            form: None,
            source: None,
        }
    }

    /// Plain-text document with a title, the common case in tests and seeds.
    pub fn text(title: &str, body: &str) -> Self {
        Self::new(SourceType::Text, body).with_title(title)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Name used in logs and batch reports.
    pub fn label(&self) -> String {
        self.key
            .clone()
            .or_else(|| self.title.clone())
            .or_else(|| self.source.clone())
            .unwrap_or_else(|| "<untitled>".to_string())
    }

    pub fn metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            title: self
                .title
                .clone()
                .or_else(|| self.key.clone())
                .unwrap_or_default(),
            category: self.category.clone(),
            form: self.form.unwrap_or_default(),
            source: self.source.clone(),
        }
    }
}

/// Logical key of a document: its explicit key, else a slug of its title,
/// else a slug of its source.
pub fn logical_key(input: &DocumentInput) -> Result<String> {
    let candidates = [&input.key, &input.title, &input.source];
    candidates
        .into_iter()
        .flatten()
        .map(|s| slugify(s))
        .find(|s| !s.is_empty())
        .ok_or_else(|| Error::document_format(input.label(), "document needs a key, title or source"))
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapsed to `-`.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in s.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
