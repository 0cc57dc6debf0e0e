//! Conversation memory routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use campuskb_runtime::ConversationSession;

use super::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/conversations/{id}", get(get_conversation))
}

#[derive(Debug, Default, Deserialize)]
struct ConversationQuery {
    #[serde(default, alias = "userId")]
    user_id: Option<String>,
}

/// GET /api/conversations/{id}?user_id=...
///
/// A conversation with an owner is only returned to that owner. Waits for
/// an in-flight turn on the same conversation to finish.
async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult<Json<ConversationSession>> {
    let handle = state
        .pipeline
        .sessions()
        .lookup(&id, query.user_id.as_deref())?;
    let session = handle.lock().await.clone();
    Ok(Json(session))
}
