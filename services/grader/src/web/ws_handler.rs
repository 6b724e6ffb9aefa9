//! services/grader/src/web/ws_handler.rs
//!
//! The push channel transport: one WebSocket per (course, user) that forwards every
//! classroom event as a JSON text frame. Heartbeats arrive over REST, not this socket.

use crate::pipeline::notifications::ChannelRole;
use crate::web::{middleware::Caller, state::AppState};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(course): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, caller, course))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, caller: Caller, course: String) {
    let pipeline = &app_state.pipeline;
    let role = if caller.privileged {
        ChannelRole::Supervisor
    } else {
        ChannelRole::Student
    };
    let mut channel = pipeline.open_channel(&course, &caller.user_id, role).await;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = channel.events.recv() => {
                // `None` means the hub dropped the channel: evicted, swept or shutting down.
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize classroom event.");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(channel = %channel.id, error = %e, "WebSocket error.");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    pipeline.close_channel(&course, &channel.id).await;
    let _ = sender.close().await;
    info!(course = %course, user = %caller.user_id, channel = %channel.id, "WebSocket connection closed.");
}
