//! WebSocket telemetry endpoint.
//!
//! Clients get an initial stats + sessions snapshot, then every frame the
//! [`TelemetryHub`] broadcasts. Inbound messages are ignored; the socket
//! closes when the client goes away.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use tokio::sync::broadcast;

use crate::proxy::server::AppState;
use crate::proxy::telemetry::TelemetryFrame;

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(mut socket: WebSocket, state: AppState) {
    tracing::debug!("websocket client connected");

    for frame in [state.telemetry.stats_frame(), state.telemetry.sessions_frame()] {
        if send_frame(&mut socket, &frame).await.is_err() {
            return;
        }
    }

    let mut rx = state.telemetry.subscribe();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "websocket client lagged behind broadcasts");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(_)) => {},
                _ => break,
            },
        }
    }

    tracing::debug!("websocket client disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &TelemetryFrame) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(payload)).await
}
