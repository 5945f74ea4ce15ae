//! Provider-agnostic types shared between the realtime provider adapters and
//! the voice relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A completed function call requested by the dialogue model.
///
/// Created once the provider signals that argument streaming is finished and
/// consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

impl FunctionCall {
    /// Builds a call from the raw argument string the provider streamed.
    ///
    /// Empty argument strings are treated as an empty object, since tools
    /// without parameters are allowed to stream nothing.
    pub fn from_raw(
        call_id: impl Into<String>,
        name: impl Into<String>,
        raw_arguments: &str,
    ) -> Result<Self, serde_json::Error> {
        let arguments = if raw_arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(raw_arguments)?
        };
        Ok(Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        })
    }
}

/// Generic events that any realtime provider can emit back to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The provider accepted the session configuration.
    SessionReady,
    /// A chunk of spoken audio from the model (base64 encoded PCM16).
    AudioDelta(String),
    /// A chunk of the model's streamed text or audio transcript.
    TextDelta(String),
    /// The model finished a text or audio transcript part.
    TextDone(String),
    /// Transcription of the user's committed audio.
    InputTranscript(String),
    /// The model finished streaming arguments for a function call.
    FunctionCall(FunctionCall),
    /// The provider finished a response.
    ResponseDone,
    /// The provider reported an error for this session.
    Error(String),
    /// A provider message could not be decoded.
    ProtocolError(String),
    /// The connection to the provider is gone.
    Disconnected(String),
    /// An event type the relay does not act on.
    Unhandled { kind: String },
}
