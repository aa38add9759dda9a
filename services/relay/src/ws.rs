//! One relayed WebSocket per connected participant.

use crate::state::AppState;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket joined to `channel`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, channel, state))
}

/// Joins the socket to its room and relays its frames until it goes away.
#[instrument(name = "relay_socket", skip_all, fields(%channel, client))]
async fn handle_socket(socket: WebSocket, channel: String, state: Arc<AppState>) {
    let (client, mut outbound) = state.rooms.join(&channel);
    tracing::Span::current().record("client", client);
    info!(members = state.rooms.member_count(&channel), "Client joined");

    let (mut socket_tx, mut socket_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = socket_rx.next().await {
        match frame {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                let delivered = state.rooms.relay(&channel, client, message);
                debug!(delivered, "Relayed frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Socket read failed");
                break;
            }
        }
    }

    state.rooms.leave(&channel, client);
    writer.abort();
    info!("Client left");
}
