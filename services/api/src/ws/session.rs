//! Manages the WebSocket connection lifecycle for a voice session.

use super::{
    client_link::{ClientLink, Inbound, decode_frame, spawn_writer},
    protocol::{ServerMessage, StatusKind},
    relay::VoiceSession,
};
use crate::state::AppState;
use axum::{
    extract::{
        State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{StreamExt, stream::SplitStream};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Creates and registers the session, drains the client side until the
/// socket goes away, then tears the session down. The upstream side is
/// drained by a task the session spawns on its first `start_recording`.
#[instrument(name = "voice_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (socket_tx, socket_rx) = socket.split();
    let (client, client_rx) = ClientLink::channel();
    let writer = spawn_writer(socket_tx, client_rx);

    let session = VoiceSession::new(
        client.clone(),
        state.dispatcher.clone(),
        state.connector.clone(),
        state.session_settings(),
    );
    let session_id = session.id();
    tracing::Span::current().record("session_id", &session_id.to_string());
    state.sessions.register(session.clone()).await;
    info!("New voice session connected.");
    client.send(ServerMessage::Connected { session_id });

    run_client_loop(&session, &client, socket_rx).await;

    session.close().await;
    state.sessions.unregister(session_id).await;
    writer.abort();
    info!("Voice session finished.");
}

/// Reads client frames in order until the client disconnects.
async fn run_client_loop(
    session: &Arc<VoiceSession>,
    client: &ClientLink,
    mut socket_rx: SplitStream<WebSocket>,
) {
    while let Some(frame) = socket_rx.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Client WebSocket error.");
                break;
            }
        };
        match decode_frame(msg) {
            Ok(Inbound::Intent(intent)) => session.handle_client_message(intent).await,
            Ok(Inbound::Close) => {
                info!("Client closed the connection.");
                break;
            }
            Ok(Inbound::Ignore) => {}
            Err(e) => {
                warn!(error = %e, "Skipping client message.");
                client.send(ServerMessage::status(StatusKind::Error, e.to_string()));
            }
        }
    }
}
