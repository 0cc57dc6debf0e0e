//! Chat routes: the inbound query interface and LLM provider configuration.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};

use campuskb_chat::{ChatRequest, ChatResponse, LLMConfigResponse, LLMConfigUpdate};
use campuskb_core::Error;

use super::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/config", get(get_config).put(update_config))
}

/// POST /api/chat
///
/// Answered and degraded turns are both 200; only an
/// invalid request is an error.
async fn chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Json<ChatResponse>> {
    let Json(request) = body.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let response = state.pipeline.chat(request).await.into_chat_response()?;
    Ok(Json(response))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<LLMConfigResponse> {
    Json(state.llm_config.read().to_response())
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LLMConfigUpdate>, JsonRejection>,
) -> ApiResult<Json<LLMConfigResponse>> {
    let Json(update) = body.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    let mut config = state.llm_config.write();
    config.apply_update(&update)?;
    config.save()?;
    Ok(Json(config.to_response()))
}
