//! Crate-wide error kinds and the HTTP/Matrix-errcode mapping for them.
//!
//! Translated from the source system's exception hierarchy (spec.md §7) into
//! a `Result`-typed design: each module defines its own leaf error enum,
//! and `BridgeError` composes them the way the teacher's `MatrixServerError`
//! composes `AuthError`/`RoomError`/`FederationError`.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Top-level error kind classification (spec.md §7). Every leaf error maps
/// to exactly one of these for the purposes of retry/alert/propagation
/// policy; the leaf variant itself still carries the specific detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    AuthExpired,
    NotFound,
    Conflict,
    MalformedInput,
    Fatal,
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("matrix error: {0}")]
    Matrix(#[from] crate::matrix::MatrixError),

    #[error("agent service error: {0}")]
    AgentService(#[from] crate::agent_service::AgentServiceError),

    #[error("mapping store error: {0}")]
    Mapping(#[from] crate::mapping::MappingError),

    #[error("dedupe store error: {0}")]
    Dedupe(#[from] crate::dedupe::DedupeError),

    #[error("provisioning error: {0}")]
    Provision(#[from] crate::provisioner::ProvisionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Matrix(e) => e.kind(),
            BridgeError::AgentService(e) => e.kind(),
            BridgeError::Mapping(e) => e.kind(),
            BridgeError::Dedupe(_) => ErrorKind::Fatal,
            BridgeError::Provision(e) => e.kind(),
            BridgeError::Config(_) => ErrorKind::Fatal,
            BridgeError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// One-line, secret-free, subsystem-named message bounded to 200 chars,
    /// suitable for posting into a Matrix room (spec.md §7).
    pub fn user_message(&self, subsystem: &str) -> String {
        let detail = self.to_string();
        let mut msg = format!("{subsystem}: {detail}");
        if msg.len() > 200 {
            msg.truncate(197);
            msg.push_str("...");
        }
        msg
    }
}

/// Exponential backoff with jitter, capped, shared by the Matrix adapter's
/// rate-limit handling and the agent-service adapter's `409 BUSY` retries
/// (spec.md §4.L3, §4.L4 both specify the same shape independently).
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    /// Returns the delay for the next attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1 << self.attempt.min(8));
        let capped = exp.min(self.cap);
        self.attempt += 1;
        let jitter_frac: f64 = rand::random::<f64>() * 0.3;
        let jittered_millis = (capped.as_millis() as f64) * (1.0 - jitter_frac);
        Duration::from_millis(jittered_millis.max(0.0) as u64)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
