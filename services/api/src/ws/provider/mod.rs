//! Adapters for third-party realtime voice APIs.
//!
//! Each provider implements `UpstreamConnector` and translates between its
//! own wire format and the relay's `UpstreamCommand`/`UpstreamEvent` types.

pub mod openai;
mod wire;

pub use openai::OpenAIRealtimeConnector;
