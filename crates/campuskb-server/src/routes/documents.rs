//! Document management: batch ingestion, file upload, listing, lookup,
//! deletion, rebuild.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::debug;

use campuskb_core::Error;
use campuskb_ingest::DocumentInput;
use campuskb_runtime::{IngestSummary, RebuildSummary};
use campuskb_store::{DocumentSummary, SourceType};

use super::ApiResult;
use crate::state::AppState;

/// Largest accepted multipart upload.
const UPLOAD_LIMIT: usize = 25 * 1024 * 1024;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/documents", post(ingest).get(list))
        .route(
            "/documents/upload",
            post(upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        .route("/documents/{id}", get(get_document).delete(delete_document))
        .route("/index/rebuild", post(rebuild))
}

/// Either `{documents: [...]}` or a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum IngestBody {
    Wrapped { documents: Vec<DocumentInput> },
    Bare(Vec<DocumentInput>),
}

/// POST /api/documents
async fn ingest(
    State(state): State<Arc<AppState>>,
    body: Result<Json<IngestBody>, JsonRejection>,
) -> ApiResult<Json<IngestSummary>> {
    let Json(body) = body.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let inputs = match body {
        IngestBody::Wrapped { documents } | IngestBody::Bare(documents) => documents,
    };
    if inputs.is_empty() {
        return Err(Error::InvalidRequest("no documents supplied".into()).into());
    }

    let summary = blocking(state, move |state| Ok(state.knowledge.ingest(&inputs))).await?;
    Ok(Json(summary))
}

/// POST /api/documents/upload (multipart)
///
/// Every file part becomes one document, typed by its extension unless a
/// `source_type` part says otherwise. `title` applies when a single file is
/// sent; `category` applies to all files.
async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<IngestSummary>> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut title = None;
    let mut category = None;
    let mut source_type: Option<SourceType> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name().map(base_name) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::InvalidRequest(e.body_text()))?;
            files.push((file_name, bytes.to_vec()));
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|e| Error::InvalidRequest(e.body_text()))?;
        match name.as_str() {
            "title" => title = Some(value),
            "category" => category = Some(value),
            "source_type" => source_type = Some(value.trim().parse()?),
            other => debug!("Ignoring upload field {}", other),
        }
    }
    if files.is_empty() {
        return Err(Error::InvalidRequest("no file supplied".into()).into());
    }

    let single = files.len() == 1;
    let inputs: Vec<DocumentInput> = files
        .into_iter()
        .map(|(file_name, bytes)| {
            let kind = source_type.unwrap_or_else(|| SourceType::from_file_name(&file_name));
            let mut input = DocumentInput::new(kind, bytes)
                .with_title(match &title {
                    Some(title) if single => title.clone(),
                    _ => file_stem(&file_name),
                });
            input.category = category.clone();
            input.source = Some(file_name);
            input
        })
        .collect();

    let summary = blocking(state, move |state| Ok(state.knowledge.ingest(&inputs))).await?;
    Ok(Json(summary))
}

fn base_name(file_name: &str) -> String {
    file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name)
        .to_string()
}

fn file_stem(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}

/// GET /api/documents
async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<DocumentSummary>>> {
    let documents = blocking(state, |state| state.knowledge.list()).await?;
    Ok(Json(documents))
}

/// GET /api/documents/{id}
///
/// The document with its chunks.
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let found = blocking(state, {
        let id = id.clone();
        move |state| state.knowledge.document(&id)
    })
    .await?;
    let (document, chunks) = found.ok_or_else(|| Error::NotFound(format!("document {}", id)))?;
    Ok(Json(json!({
        "document": document,
        "chunks": chunks,
    })))
}

/// DELETE /api/documents/{id}
async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let deleted = blocking(state, {
        let id = id.clone();
        move |state| state.knowledge.delete(&id)
    })
    .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("document {}", id)).into())
    }
}

/// POST /api/index/rebuild
async fn rebuild(State(state): State<Arc<AppState>>) -> ApiResult<Json<RebuildSummary>> {
    let summary = blocking(state, |state| state.knowledge.rebuild()).await?;
    Ok(Json(summary))
}

/// Run store and embedding work off the async workers.
pub(crate) async fn blocking<T, F>(state: Arc<AppState>, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> campuskb_core::Result<T> + Send + 'static,
{
    task::spawn_blocking(move || f(state.as_ref()))
        .await
        .map_err(|e| Error::Storage(format!("worker task failed: {}", e)))?
        .map_err(Into::into)
}
