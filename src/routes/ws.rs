//! WebSocket handler — transport boundary of the relay.
//!
//! DESIGN
//! ======
//! On upgrade the connection registers with the relay and gets an outbound
//! queue, then enters a `select!` loop:
//! - Incoming client text frames → parse → submit to the relay
//! - Frames queued by the relay → serialize → send to the client
//!
//! This module never decides who receives what; it only frames JSON and
//! detects disconnects. Malformed and binary frames are logged and
//! dropped, the connection stays open.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → `relay.connect` (queue handed back with roster + `loadSession`)
//! 2. Text frames → `relay.submit`
//! 3. Socket close/error, or the relay dropping our queue → exit loop
//! 4. `relay.disconnect` → peers get `userLeave`

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{ClientEvent, ServerEvent, parse_client_event};
use crate::services::relay::{Joined, RelayError};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let Joined { identity, outbound: mut outbound_rx } = match state.relay.connect().await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(error = %e, "ws: connection rejected");
            let close = CloseFrame { code: close_code::AGAIN, reason: e.to_string().into() };
            let _ = socket.send(Message::Close(Some(close))).await;
            return;
        }
    };
    let connection_id = identity.connection_id;
    info!(%connection_id, name = %identity.display_name, "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        if let Err(e) = process_inbound_text(&state, connection_id, &text).await {
                            warn!(%connection_id, error = %e, "ws: relay unavailable");
                            break;
                        }
                    }
                    Message::Binary(bytes) => {
                        warn!(%connection_id, len = bytes.len(), "ws: dropping binary frame");
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            event = outbound_rx.recv() => {
                // The relay drops our queue when it evicts us.
                let Some(event) = event else {
                    info!(%connection_id, "ws: evicted by relay");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if send_event(&mut socket, connection_id, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = state.relay.disconnect(connection_id).await {
        warn!(%connection_id, error = %e, "ws: disconnect not delivered");
    }
    info!(%connection_id, "ws: client disconnected");
}

// =============================================================================
// FRAMING
// =============================================================================

/// Parse one inbound text frame and hand it to the relay.
///
/// Protocol errors are logged and swallowed; only a dead relay is an error.
async fn process_inbound_text(state: &AppState, connection_id: Uuid, text: &str) -> Result<(), RelayError> {
    let event = match parse_client_event(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%connection_id, error = %e, "ws: dropping inbound frame");
            return Ok(());
        }
    };
    if !matches!(event, ClientEvent::Cursor { .. }) {
        debug!(%connection_id, kind = event.kind(), "ws: recv frame");
    }
    state.relay.submit(connection_id, event).await
}

async fn send_event(socket: &mut WebSocket, connection_id: Uuid, event: &ServerEvent) -> Result<(), ()> {
    let json = match event.encode() {
        Ok(j) => j,
        Err(e) => {
            // Skipping the frame would leave a gap in this client's stream.
            warn!(%connection_id, error = %e, kind = event.kind(), "ws: failed to serialize frame; closing");
            return Err(());
        }
    };
    if !matches!(event, ServerEvent::Cursor { .. }) {
        debug!(%connection_id, kind = event.kind(), "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
