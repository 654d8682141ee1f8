//! WebSocket transport
//!
//! Upgrades `/ws/{username}` and adapts the axum socket to the session
//! loop's `Inbound` stream and `String` sink.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, future};
use tracing::debug;

use crate::AppState;
use crate::session::Inbound;

pub async fn websocket_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if username.is_empty() {
        return (StatusCode::BAD_REQUEST, "username must not be empty").into_response();
    }

    let max_frame_bytes = state.relay.config().max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_websocket(socket, username, state))
}

pub async fn handle_websocket(socket: WebSocket, username: String, state: AppState) {
    let (sender, receiver) = socket.split();

    let outbound = sender.with(|text: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });

    let inbound = receiver.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
            Ok(Message::Close(_)) => Some(Ok(Inbound::Close)),
            Ok(Message::Binary(_)) => {
                debug!("Binary messages not supported");
                None
            }
            // Pings are answered by axum itself
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(e) => Some(Err(e)),
        })
    });

    state.relay.run_session(username, inbound, outbound).await;
}
