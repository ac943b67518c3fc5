#![forbid(unsafe_code)]

// Roomcast library - room orchestration and signaling for a selective
// forwarding media engine

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod metrics;
pub mod negotiation;
pub mod room;
pub mod session;
pub mod signaling;
