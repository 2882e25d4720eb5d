use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use crate::models::{
    ActivateSessionRequest, AppState, SessionResponse, TransactionsResponse, VideoProgressResponse,
};
use crate::types::AppResult;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", post(activate_session))
        .route("/api/sessions/{id}", get(get_session).delete(teardown_session))
        .route("/api/sessions/{id}/videos/{video_id}", get(get_video_progress))
        .route("/api/sessions/{id}/transactions", get(get_transactions))
        .with_state(state)
}

/// Bind viewer/creator credentials, creating the session if needed.
async fn activate_session(
    State(state): State<AppState>,
    Json(request): Json<ActivateSessionRequest>,
) -> AppResult<Json<SessionResponse>> {
    let ActivateSessionRequest {
        session_id,
        credentials,
    } = request;
    info!(session_id = ?session_id, viewer = %credentials.viewer_node_id, "Activating session");

    let session = state
        .registry
        .activate(session_id.as_deref(), credentials)
        .await?;
    let invoice = session.context().invoices.get_invoice().await;

    Ok(Json(SessionResponse {
        session_id: session.session_id().to_string(),
        phase: session.phase().await,
        invoice: invoice.map(|invoice| invoice.encoded),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SessionResponse>> {
    let session = state.registry.get(&id).await?;
    let invoice = session.context().invoices.get_invoice().await;

    Ok(Json(SessionResponse {
        session_id: id,
        phase: session.phase().await,
        invoice: invoice.map(|invoice| invoice.encoded),
    }))
}

async fn teardown_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.registry.teardown(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_video_progress(
    State(state): State<AppState>,
    Path((id, video_id)): Path<(String, String)>,
) -> AppResult<Json<VideoProgressResponse>> {
    let session = state.registry.get(&id).await?;
    let progress = &session.context().progress;
    let played_ranges = progress.get_played_ranges(&video_id).await;

    Ok(Json(VideoProgressResponse {
        played_duration: crate::metering::total_duration(&played_ranges),
        played_ranges,
        video_id,
    }))
}

async fn get_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<TransactionsResponse>> {
    let session = state.registry.get(&id).await?;
    Ok(Json(TransactionsResponse {
        transactions: session.context().observer.cached_transactions().await,
    }))
}
