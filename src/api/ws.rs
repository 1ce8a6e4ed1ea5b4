// =============================================================================
// WebSocket Handler: push-based engine event feed
// =============================================================================
//
// Clients connect to `/api/v1/events` and receive:
//   1. An immediate full StateSnapshot on connect.
//   2. Every engine event as it is published on the bus.
//   3. A fresh snapshot whenever the state version changed since the last
//      periodic check (500 ms).
//
// Lagging clients skip events rather than back-pressure the engine; a lag
// notice is sent so consumers know to re-sync from the snapshot.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::engine_state::EngineState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<EngineState>>,
) -> impl IntoResponse {
    info!("event feed connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Manages one WebSocket connection until the client disconnects.
async fn handle_connection(mut socket: WebSocket, state: Arc<EngineState>) {
    let mut events = state.bus.subscribe();
    let mut ticker = interval(Duration::from_millis(500));
    let mut last_version = 0u64;

    // Initial snapshot so the client starts from a consistent view.
    if let Ok(payload) = serde_json::to_string(&state.build_snapshot()) {
        if socket.send(Message::Text(payload)).await.is_err() {
            return;
        }
        last_version = state.current_state_version();
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event feed client lagged");
                        let notice = format!("{{\"type\":\"lagged\",\"skipped\":{skipped}}}");
                        if socket.send(Message::Text(notice)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = ticker.tick() => {
                let version = state.current_state_version();
                if version != last_version {
                    last_version = version;
                    let Ok(payload) = serde_json::to_string(&state.build_snapshot()) else {
                        continue;
                    };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // read-only feed: client text is ignored
                    Some(Err(e)) => {
                        debug!(error = %e, "event feed read error");
                        break;
                    }
                }
            }
        }
    }

    info!("event feed client disconnected");
}
