use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use tracing::{debug, warn};

use crate::models::AppState;
use crate::orchestrator::{Reply, StreamMessage};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions/{id}/messages", post(post_message))
        .with_state(state)
}

/// Deliver one playback message to the session's orchestrator. Sessions
/// must be activated first; unknown or torn-down ids are a 404.
///
/// The body is decoded here rather than by the `Json` extractor so that
/// non-numeric telemetry is reported as malformed (400), like any other bad report.
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<Json<Reply>> {
    let session = state.registry.get(&id).await?;
    let message: StreamMessage = serde_json::from_value(body).map_err(|e| {
        warn!(session_id = %id, error = %e, "Rejecting malformed message");
        AppError::MalformedTelemetry(e.to_string())
    })?;
    debug!(session_id = %id, message = ?message, "Message received");

    let reply = session.handle(message).await?;
    Ok(Json(reply))
}
