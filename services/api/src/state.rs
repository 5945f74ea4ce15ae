//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every handler and session needs.

use crate::{
    config::Config,
    ws::{
        dispatch::FunctionDispatcher, registry::SessionRegistry, relay::SessionSettings,
        upstream::UpstreamConnector,
    },
};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub dispatcher: Arc<FunctionDispatcher>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub system_prompt: Arc<String>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            instructions: self.system_prompt.to_string(),
            rollback_window: self.config.rollback_window,
        }
    }
}
