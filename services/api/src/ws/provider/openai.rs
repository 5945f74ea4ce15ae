//! Handles the realtime WebSocket connection to OpenAI for voice interaction.

use super::wire::{self, ClientEvent};
use crate::{
    error::RelayError,
    ws::upstream::{UpstreamCommand, UpstreamConnection, UpstreamConnector, UpstreamLink, UpstreamSetup},
};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use gitvoice_core::generic_types::UpstreamEvent;
use std::{collections::HashMap, time::Duration};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects sessions to the OpenAI Realtime API.
#[derive(Clone, Debug)]
pub struct OpenAIRealtimeConnector {
    pub url: String,
    pub model: String,
    pub api_key: String,
    pub voice: String,
    pub ready_timeout: Duration,
}

#[async_trait]
impl UpstreamConnector for OpenAIRealtimeConnector {
    async fn connect(&self, setup: UpstreamSetup) -> Result<UpstreamConnection, RelayError> {
        let url = format!("{}?model={}", self.url, self.model);
        let mut request = url.into_client_request()?;
        let bearer = format!("Bearer {}", self.api_key)
            .parse::<HeaderValue>()
            .map_err(|_| RelayError::Connection("API key is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, _) = connect_async(request).await?;
        let (mut openai_tx, mut openai_rx) = ws_stream.split();
        info!(model = %self.model, "Connected to OpenAI Realtime API.");

        // Configure the realtime session and wait for the provider to accept it.
        send_event(&mut openai_tx, &wire::initial_session_update(&setup, &self.voice)).await?;
        let mut function_names = HashMap::new();
        tokio::time::timeout(
            self.ready_timeout,
            wait_until_ready(&mut openai_rx, &mut function_names),
        )
        .await
        .map_err(|_| RelayError::Connection("timed out waiting for the session".into()))??;
        info!("OpenAI realtime session is ready.");

        let (link, commands) = UpstreamLink::channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(
            run_link(openai_tx, openai_rx, commands, event_tx, function_names)
                .instrument(tracing::Span::current()),
        );
        Ok(UpstreamConnection { link, events })
    }
}

async fn send_event(
    openai_tx: &mut SplitSink<WsStream, WsMessage>,
    event: &ClientEvent,
) -> Result<(), RelayError> {
    let text = serde_json::to_string(event)?;
    openai_tx.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

async fn wait_until_ready(
    openai_rx: &mut SplitStream<WsStream>,
    function_names: &mut HashMap<String, String>,
) -> Result<(), RelayError> {
    while let Some(frame) = openai_rx.next().await {
        match frame? {
            WsMessage::Text(text) => match wire::decode_server_event(text.as_str(), function_names) {
                Ok(UpstreamEvent::SessionReady) => return Ok(()),
                Ok(UpstreamEvent::Error(message)) => return Err(RelayError::Connection(message)),
                Ok(other) => debug!(event = ?other, "Event before session was ready"),
                Err(e) => warn!(error = %e, "Ignoring upstream message during setup"),
            },
            WsMessage::Close(frame) => {
                return Err(RelayError::Connection(format!(
                    "closed during setup: {:?}",
                    frame.map(|f| f.reason.to_string())
                )));
            }
            _ => {}
        }
    }
    Err(RelayError::Connection("connection ended during setup".into()))
}

/// Proxies commands to OpenAI and decoded events back to the session until
/// either side goes away.
async fn run_link(
    mut openai_tx: SplitSink<WsStream, WsMessage>,
    mut openai_rx: SplitStream<WsStream>,
    mut commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
    mut function_names: HashMap<String, String>,
) {
    loop {
        tokio::select! {
            biased;
            // Handle commands from the session (e.g., audio to send).
            command = commands.recv() => match command {
                None | Some(UpstreamCommand::Close) => {
                    let _ = openai_tx.send(WsMessage::Close(None)).await;
                    info!("Upstream link closed by session.");
                    break;
                }
                Some(command) => {
                    let Some(event) = wire::encode_command(command) else { continue };
                    if let Err(e) = send_event(&mut openai_tx, &event).await {
                        error!(error = %e, "Failed to write to OpenAI.");
                        let _ = events.send(UpstreamEvent::Disconnected(e.to_string()));
                        break;
                    }
                }
            },
            // Handle events from the OpenAI server (e.g., audio to play).
            frame = openai_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match wire::decode_server_event(text.as_str(), &mut function_names) {
                        Ok(event) => {
                            if events.send(event).is_err() {
                                debug!("Session dropped its event receiver.");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping upstream message");
                            if events.send(UpstreamEvent::ProtocolError(e.to_string())).is_err() {
                                debug!("Session dropped its event receiver.");
                                break;
                            }
                        }
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by provider".to_string());
                    warn!(%reason, "OpenAI closed the connection.");
                    let _ = events.send(UpstreamEvent::Disconnected(reason));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "OpenAI WebSocket error.");
                    let _ = events.send(UpstreamEvent::Disconnected(e.to_string()));
                    break;
                }
                None => {
                    let _ = events.send(UpstreamEvent::Disconnected("stream ended".to_string()));
                    break;
                }
            },
        }
    }
}
