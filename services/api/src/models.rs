//! API Models
//!
//! This module defines the data structures exposed over the REST API and used
//! for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// The single authoritative state of a voice session.
#[derive(Serialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Recording,
    Processing,
    Executing,
    Error,
    Closed,
}

// Implement Display for easy conversion to a string, useful for logging.
impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Recording => "recording",
            SessionState::Processing => "processing",
            SessionState::Executing => "executing",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One entry of a session's streamed assistant text.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub text: String,
    /// True for entries the relay inserted itself, such as interruption markers.
    pub synthetic: bool,
}

/// An advisory or log-only record of a tool result.
#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ArtifactEntry {
    pub function: String,
    pub success: bool,
    #[schema(value_type = Object)]
    pub result: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionSummary {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, example = "idle")]
    pub state: SessionState,
    pub current_project: Option<String>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionSnapshot {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, example = "processing")]
    pub state: SessionState,
    pub current_project: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub processed_calls: usize,
    pub transcript: Vec<TranscriptEntry>,
    pub artifacts: Vec<ArtifactEntry>,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ToolSummary {
    #[schema(example = "create_issue")]
    pub name: String,
    pub description: String,
    #[schema(example = "standard")]
    pub category: String,
    #[schema(value_type = Object)]
    pub parameters: Value,
}

#[derive(Serialize, ToSchema, Debug)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    pub active_sessions: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
