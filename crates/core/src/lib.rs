//! Core library for the control plane gateway
//!
//! Process-scoped durable state, each owned by an explicit store object:
//! - Device & node pairing, with scoped token issue/rotate/revoke
//! - Exec approval policy and the interactive approval gate
//! - The append-only trace store

pub mod approvals;
pub mod device_auth;
pub mod error;
pub mod pairing;
pub mod tokens;
pub mod trace;

pub use error::{ApprovalError, PairingError, TraceError};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
