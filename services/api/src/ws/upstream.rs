//! The provider-facing half of a voice session.
//!
//! An `UpstreamLink` is a sending handle into a provider task; the task owns
//! the actual socket and reports back through an `UpstreamEvent` channel.
//! Links are never reconnected: once the task ends, the session drops the
//! link and connects a fresh one on the next `start_recording`.

use crate::error::RelayError;
use async_trait::async_trait;
use gitvoice_core::{generic_types::UpstreamEvent, tools::ToolDescriptor};
use tokio::sync::mpsc;

/// An intent the relay asks the provider task to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamCommand {
    /// Append base64 PCM16 audio to the input buffer.
    AppendAudio(String),
    CommitAudio,
    ClearAudio,
    /// Ask for a response with text and audio modalities.
    RequestResponse,
    /// Abandon the response currently being generated.
    CancelResponse,
    /// Return a tool's output for `call_id`.
    FunctionOutput { call_id: String, output: String },
    /// Replace the behavioral instructions of the live session.
    UpdateInstructions(String),
    Close,
}

/// What a provider needs to initialize a session.
#[derive(Debug, Clone)]
pub struct UpstreamSetup {
    pub instructions: String,
    pub tools: &'static [ToolDescriptor],
}

/// A ready upstream session: the sending link plus the event stream.
pub struct UpstreamConnection {
    pub link: UpstreamLink,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

/// Establishes upstream sessions. One call per (re)connection.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connects and returns once the provider has confirmed the session.
    async fn connect(&self, setup: UpstreamSetup) -> Result<UpstreamConnection, RelayError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamLink {
    tx: mpsc::UnboundedSender<UpstreamCommand>,
}

impl UpstreamLink {
    pub fn new(tx: mpsc::UnboundedSender<UpstreamCommand>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// True once the provider task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, command: UpstreamCommand) -> Result<(), RelayError> {
        self.tx
            .send(command)
            .map_err(|_| RelayError::Connection("upstream link is closed".to_string()))
    }

    pub fn append_audio(&self, audio_base64: String) -> Result<(), RelayError> {
        self.send(UpstreamCommand::AppendAudio(audio_base64))
    }

    pub fn commit_audio(&self) -> Result<(), RelayError> {
        self.send(UpstreamCommand::CommitAudio)
    }

    pub fn clear_audio(&self) -> Result<(), RelayError> {
        self.send(UpstreamCommand::ClearAudio)
    }

    pub fn request_response(&self) -> Result<(), RelayError> {
        self.send(UpstreamCommand::RequestResponse)
    }

    pub fn cancel_response(&self) -> Result<(), RelayError> {
        self.send(UpstreamCommand::CancelResponse)
    }

    pub fn function_output(&self, call_id: &str, output: String) -> Result<(), RelayError> {
        self.send(UpstreamCommand::FunctionOutput {
            call_id: call_id.to_string(),
            output,
        })
    }

    pub fn update_instructions(&self, instructions: String) -> Result<(), RelayError> {
        self.send(UpstreamCommand::UpdateInstructions(instructions))
    }

    /// Asks the provider task to close the socket. Safe to call repeatedly.
    pub fn close(&self) {
        let _ = self.tx.send(UpstreamCommand::Close);
    }
}
