//! Relay error taxonomy.
//!
//! Only the affected session ever reacts to these; none of them may take the
//! process down.

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The upstream service is unreachable, rejected our credentials, or
    /// never confirmed the session. The session can retry.
    #[error("Voice connection failed: {0}")]
    Connection(String),
    /// An upstream message was malformed or unexpected. Logged and skipped.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A collaborator call failed. Reported as a failed outcome.
    #[error("Tool error: {0}")]
    Tool(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}
