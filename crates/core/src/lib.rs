//! Core types and collaborators for the voice-driven repository assistant.
//!
//! Nothing in this crate knows about WebSockets or a particular realtime
//! provider: it holds the tool catalog, the provider-agnostic event set, and
//! the project, tool and advisor collaborators the relay calls into.

pub mod advisor;
pub mod executor;
pub mod generic_types;
pub mod project;
pub mod tools;
