// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use thiserror::Error;

/// The main error enum, representing all possible failures within the room runtime.
/// Using `thiserror` allows for clean error definitions and automatic `Display` impls.
/// The enum is `Clone` so surfaced errors can be fanned out on the `error` event channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoomError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server closed the channel with a rejection close code in `[4000, 4100]`.
    #[error("Room connection rejected by server (code {code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Storage write denied: the current session is read-only")]
    WriteDenied,

    /// The server refused one or more storage ops. The local replica keeps its
    /// state; divergence is accepted rather than repaired.
    #[error("Storage mutation rejected by server: {reason}")]
    StorageMutationRejected { op_ids: Vec<String>, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Room is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}
