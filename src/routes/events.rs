//! Websocket UI relay
//!
//! Streams the session's [`RelayEvent`]s (transaction updates, progress
//! changes, observer warnings) to a connected UI as JSON text frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::models::AppState;
use crate::observer::RelayEvent;
use crate::types::AppResult;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions/{id}/events", get(events_handler))
        .with_state(state)
}

async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let session = state.registry.get(&id).await?;
    let relay = session.context().subscribe_relay();
    Ok(ws.on_upgrade(move |socket| relay_events(socket, id, relay)))
}

async fn relay_events(socket: WebSocket, session_id: String, mut relay: broadcast::Receiver<RelayEvent>) {
    let (mut sender, mut receiver) = socket.split();
    debug!(session_id = %session_id, "UI relay connected");

    loop {
        tokio::select! {
            event = relay.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Failed to encode relay event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "UI relay lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "UI relay socket error");
                    break;
                }
                // the relay is one-way; anything else from the client is ignored
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(session_id = %session_id, "UI relay disconnected");
}
