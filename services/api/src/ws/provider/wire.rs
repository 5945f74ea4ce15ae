//! OpenAI Realtime wire types, kept local to the adapter.
//!
//! Only the fields the relay reads or writes are modelled; everything else in
//! a server event is ignored, and unknown event types decode to `Other`.

use crate::ws::upstream::{UpstreamCommand, UpstreamSetup};
use crate::error::RelayError;
use gitvoice_core::generic_types::{FunctionCall, UpstreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

const MODALITIES: [&str; 2] = ["text", "audio"];

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub(super) enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseConfig },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

#[derive(Serialize, Debug, Default, PartialEq)]
pub(super) struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscription>,
    /// `Some(Value::Null)` disables server-side turn detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<&'static str>,
}

#[derive(Serialize, Debug, PartialEq)]
pub(super) struct AudioTranscription {
    pub model: &'static str,
}

#[derive(Serialize, Debug, PartialEq)]
pub(super) struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Serialize, Debug, PartialEq)]
pub(super) struct ResponseConfig {
    pub modalities: Vec<&'static str>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub(super) enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(rename = "session.updated")]
    SessionUpdated {},
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone { transcript: String },
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },
    #[serde(rename = "response.text.done")]
    ResponseTextDone { text: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted { transcript: String },
    #[serde(rename = "response.output_item.added")]
    ResponseOutputItemAdded { item: OutputItem },
    #[serde(rename = "response.function_call_arguments.done")]
    ResponseFunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone {},
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug)]
pub(super) struct ApiError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// Reported when a cancel reaches the provider after the response finished.
const CANCEL_NOT_ACTIVE: &str = "response_cancel_not_active";

#[derive(Deserialize, Debug)]
pub(super) struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Builds the `session.update` sent right after connecting.
pub(super) fn initial_session_update(setup: &UpstreamSetup, voice: &str) -> ClientEvent {
    let tools = setup
        .tools
        .iter()
        .map(|tool| ToolDefinition {
            kind: "function",
            name: tool.name,
            description: tool.description,
            parameters: tool.parameters.clone(),
        })
        .collect();
    ClientEvent::SessionUpdate {
        session: SessionConfig {
            modalities: Some(MODALITIES.to_vec()),
            instructions: Some(setup.instructions.clone()),
            voice: Some(voice.to_string()),
            input_audio_format: Some("pcm16"),
            output_audio_format: Some("pcm16"),
            input_audio_transcription: Some(AudioTranscription { model: "whisper-1" }),
            turn_detection: Some(Value::Null),
            tools: Some(tools),
            tool_choice: Some("auto"),
        },
    }
}

/// Translates a relay command into its wire event. `Close` has none.
pub(super) fn encode_command(command: UpstreamCommand) -> Option<ClientEvent> {
    let event = match command {
        UpstreamCommand::AppendAudio(audio) => ClientEvent::InputAudioBufferAppend { audio },
        UpstreamCommand::CommitAudio => ClientEvent::InputAudioBufferCommit,
        UpstreamCommand::ClearAudio => ClientEvent::InputAudioBufferClear,
        UpstreamCommand::RequestResponse => ClientEvent::ResponseCreate {
            response: ResponseConfig {
                modalities: MODALITIES.to_vec(),
            },
        },
        UpstreamCommand::CancelResponse => ClientEvent::ResponseCancel,
        UpstreamCommand::FunctionOutput { call_id, output } => ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput { call_id, output },
        },
        UpstreamCommand::UpdateInstructions(instructions) => ClientEvent::SessionUpdate {
            session: SessionConfig {
                instructions: Some(instructions),
                ..Default::default()
            },
        },
        UpstreamCommand::Close => return None,
    };
    Some(event)
}

/// Decodes one server text frame into the relay's event set.
///
/// `function_names` remembers the name announced by `response.output_item.added`
/// for each pending call, since the arguments-done event may omit it.
pub(super) fn decode_server_event(
    text: &str,
    function_names: &mut HashMap<String, String>,
) -> Result<UpstreamEvent, RelayError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Protocol("server event without a type".to_string()))?
        .to_string();
    let event: ServerEvent = serde_json::from_value(value)
        .map_err(|e| RelayError::Protocol(format!("malformed '{kind}' event: {e}")))?;

    let decoded = match event {
        ServerEvent::Error { error } if error.code.as_deref() == Some(CANCEL_NOT_ACTIVE) => {
            UpstreamEvent::Unhandled { kind }
        }
        ServerEvent::Error { error } => UpstreamEvent::Error(error.message),
        ServerEvent::SessionUpdated {} => UpstreamEvent::SessionReady,
        ServerEvent::ResponseAudioDelta { delta } => UpstreamEvent::AudioDelta(delta),
        ServerEvent::ResponseAudioTranscriptDelta { delta }
        | ServerEvent::ResponseTextDelta { delta } => UpstreamEvent::TextDelta(delta),
        ServerEvent::ResponseAudioTranscriptDone { transcript } => UpstreamEvent::TextDone(transcript),
        ServerEvent::ResponseTextDone { text } => UpstreamEvent::TextDone(text),
        ServerEvent::InputAudioTranscriptionCompleted { transcript } => {
            UpstreamEvent::InputTranscript(transcript)
        }
        ServerEvent::ResponseOutputItemAdded { item } => {
            if let ("function_call", Some(call_id), Some(name)) =
                (item.kind.as_str(), item.call_id, item.name)
            {
                function_names.insert(call_id, name);
            }
            UpstreamEvent::Unhandled { kind }
        }
        ServerEvent::ResponseFunctionCallArgumentsDone {
            call_id,
            name,
            arguments,
        } => {
            let remembered = function_names.remove(&call_id);
            let name = name.or(remembered).ok_or_else(|| {
                RelayError::Protocol(format!("function call '{call_id}' has no name"))
            })?;
            let call = FunctionCall::from_raw(call_id, name, &arguments).map_err(|e| {
                RelayError::Protocol(format!("function call arguments are not JSON: {e}"))
            })?;
            UpstreamEvent::FunctionCall(call)
        }
        ServerEvent::ResponseDone {} => UpstreamEvent::ResponseDone,
        ServerEvent::Other => UpstreamEvent::Unhandled { kind },
    };
    Ok(decoded)
}
