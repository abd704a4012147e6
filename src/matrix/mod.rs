//! L3 — Matrix API Adapter (spec.md §4.L3).
//!
//! A thin client-server client talking the Matrix HTTP API directly over
//! `reqwest`. The teacher's `Cargo.toml` lists `matrix-sdk` but its source
//! never imports it; this crate continues that choice deliberately — the
//! spec needs txn-id-level control over retries and typed `errcode`
//! decoding a higher-level SDK would abstract away.

pub mod client;
pub mod types;

pub use client::{CachedToken, MatrixClient, MatrixError};
pub use types::*;
