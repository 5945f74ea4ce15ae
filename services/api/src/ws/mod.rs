//! WebSocket Voice Relay
//!
//! This module contains the real-time voice session relay. It is structured
//! into submodules:
//!
//! - `protocol`: the JSON message format between the browser and the server.
//! - `client_link`: frame decoding and the outbound writer for the browser socket.
//! - `upstream`: the provider-facing link and the connector trait.
//! - `provider`: the OpenAI Realtime connector and its wire types.
//! - `dispatch`: resolves function calls and classifies their outcomes.
//! - `relay`: the per-connection session state machine.
//! - `registry`: the table of live sessions.
//! - `session`: the WebSocket connection lifecycle.

pub mod client_link;
pub mod dispatch;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod relay;
pub mod session;
pub mod upstream;

pub use session::ws_handler;
