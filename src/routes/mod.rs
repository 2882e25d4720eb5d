//! API Routes
//!
//! - `/api/health` - Health check
//! - `/api/sessions` - Credential activation and session teardown
//! - `/api/sessions/{id}/messages` - Playback messages for the orchestrator
//! - `/api/sessions/{id}/videos/{video_id}` - Played ranges of a video
//! - `/api/sessions/{id}/transactions` - Transactions seen this session
//! - `/api/sessions/{id}/events` - Websocket UI relay

pub mod events;
pub mod health;
pub mod messages;
pub mod sessions;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::apply_cors;
use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");
    let allowed_origins = state.config.server.cors_allowed_origins.clone();

    let router = Router::new()
        .merge(health::router(state.clone()))
        .merge(sessions::router(state.clone()))
        .merge(messages::router(state.clone()))
        .merge(events::router(state))
        .layer(TraceLayer::new_for_http());

    apply_cors(router, &allowed_origins)
}
