//! Liveness, backend health and status routes.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(backend_health))
        .route("/status", get(status))
}

/// GET /health
///
/// The process is up. Never touches a backend.
pub async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/health
///
/// Gate-backed backend health; probes only when the
/// cached verdict has expired.
async fn backend_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gate = state.pipeline.gate();
    gate.check().await;
    let snapshot = gate.snapshot();
    Json(json!({
        "available": snapshot.available,
        "state": snapshot.state,
        "checked_at_age_secs": snapshot.checked_at_age_secs,
    }))
}

/// GET /api/status
///
/// Read-only snapshot from counters and cached corpus totals. Never probes,
/// never touches the database and never waits on the query path.
async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let index = state.knowledge.index();
    let corpus = state.knowledge.corpus_stats();
    let provider = state.llm_config.read().resolve_provider();

    Json(json!({
        "gate": state.pipeline.gate().snapshot(),
        "pipeline": state.pipeline.stats().snapshot(),
        "index": {
            "chunks": index.len(),
            "dimension": index.dimension(),
            "metric": index.metric(),
            "generation": index.generation(),
        },
        "corpus": corpus,
        "llm": {
            "provider": provider.as_ref().map(|p| p.provider.as_str()),
            "model": provider.as_ref().map(|p| p.model.clone()),
        },
        "conversations": state.pipeline.sessions().len(),
        "uptime_secs": state.uptime_secs(),
    }))
}
