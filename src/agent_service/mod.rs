//! L4 — Agent Service Adapter (spec.md §4.L4).
//!
//! Streaming and non-streaming message submission, agent list, conversation
//! create/resume, and the stream event taxonomy. The backend dispatch is a
//! small closed set `{letta, generic_http}` behind this module's trait, not
//! an open plugin system (spec.md §9).

pub mod client;
pub mod types;

pub use client::{AgentServiceAdapter, AgentServiceClient, AgentServiceError};
pub use types::*;
