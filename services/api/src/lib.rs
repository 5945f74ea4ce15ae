//! GitVoice API Library Crate
//!
//! This library contains all the logic for the GitVoice web service: the
//! configuration, application state, REST handlers, routing, and the
//! WebSocket voice relay. The binaries are thin wrappers around it.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
