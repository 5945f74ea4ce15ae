//! Defines the WebSocket message protocol between the browser client and the API server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
///
/// Raw binary frames are accepted as well and are treated as `Audio`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A chunk of captured audio, base64 encoded PCM16.
    Audio { audio_data: String },
    /// Begins an utterance. Interrupts any turn still in flight.
    StartRecording,
    /// Ends an utterance and asks the model to respond.
    StopRecording,
    /// Rebinds the active repository.
    SelectProject { project: String },
    /// Calls a tool directly, bypassing the dialogue model. Diagnostics only.
    #[serde(rename = "test_function")]
    TestFunction {
        project: Option<String>,
        function: String,
        #[serde(default)]
        args: Value,
    },
}

/// The kind carried by a `status` event.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connecting,
    Recording,
    Processing,
    Executing,
    Completed,
    Ready,
    ProjectSelected,
    Interrupted,
    Error,
}

/// Who produced a piece of transcript.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after the socket is accepted.
    Connected { session_id: Uuid },
    /// Progress and terminal status for every request the client made.
    Status {
        status: StatusKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project: Option<String>,
    },
    /// Streamed user or assistant transcript.
    Transcription {
        text: String,
        role: TranscriptRole,
        is_final: bool,
    },
    /// A playable chunk of the assistant's voice (base64 encoded PCM16).
    AudioResponse { audio_data: String },
    /// The result of a tool call.
    FunctionResult {
        function: String,
        result: Value,
        success: bool,
    },
    /// A specialist answer delivered without further dialogue synthesis.
    Advice {
        question: String,
        advice: String,
        repository: Option<String>,
    },
    /// The previous turn was rolled back; only the first `retained`
    /// streamed transcript entries survive.
    Interrupted { retained: usize },
}

impl ServerMessage {
    pub fn status(status: StatusKind, message: impl Into<String>) -> Self {
        ServerMessage::Status {
            status,
            message: message.into(),
            project: None,
        }
    }

    pub fn project_status(
        status: StatusKind,
        message: impl Into<String>,
        project: Option<String>,
    ) -> Self {
        ServerMessage::Status {
            status,
            message: message.into(),
            project,
        }
    }
}
