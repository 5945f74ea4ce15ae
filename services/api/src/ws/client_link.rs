//! The client-facing half of a voice session.
//!
//! Outbound events go through an unbounded channel drained by a single writer
//! task, so either of the session's read loops can send without holding the
//! socket.

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::RelayError;
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use futures_util::{SinkExt, stream::SplitSink};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

/// Sending handle for events addressed to the client.
#[derive(Clone, Debug)]
pub struct ClientLink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientLink {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { tx }
    }

    /// Creates a link together with the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Queues an event for the client. A closed client is not an error here;
    /// the read loop notices the disconnect and tears the session down.
    pub fn send(&self, msg: ServerMessage) {
        if self.tx.send(msg).is_err() {
            debug!("Dropping event for disconnected client.");
        }
    }
}

/// What one inbound WebSocket frame means to the session.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Intent(ClientMessage),
    Close,
    Ignore,
}

/// Decodes a WebSocket frame into a client intent.
///
/// Binary frames are raw PCM16 and are passed on as opaque audio.
pub fn decode_frame(msg: Message) -> Result<Inbound, RelayError> {
    match msg {
        Message::Text(text) => serde_json::from_str::<ClientMessage>(&text)
            .map(Inbound::Intent)
            .map_err(|e| RelayError::Protocol(format!("Unrecognized client message: {e}"))),
        Message::Binary(data) => Ok(Inbound::Intent(ClientMessage::Audio {
            audio_data: base64::engine::general_purpose::STANDARD.encode(&data),
        })),
        Message::Close(_) => Ok(Inbound::Close),
        Message::Ping(_) | Message::Pong(_) => Ok(Inbound::Ignore),
    }
}

/// Spawns the task that writes queued events to the socket.
pub fn spawn_writer(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_msg(&mut socket_tx, msg).await {
                error!(error = ?e, "Failed to write to client WebSocket.");
                break;
            }
        }
        let _ = socket_tx.close().await;
    })
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
