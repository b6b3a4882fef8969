//! Shared error kinds.
//!
//! Handler-recoverable errors become FAIL responses at the protocol
//! boundary; `AuthFailed` and `Protocol` terminate the session.

use thiserror::Error;

/// Engine-wide error kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// SRP exchange or password verification failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Unexpected message, missing field, or malformed frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// AEAD tag or delta basis mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// I/O failure in the blob store or scratch space.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Constraint violation or corruption in the metadata database.
    #[error("database error: {0}")]
    Db(String),

    /// Disabled client, missing password, or other policy refusal.
    #[error("policy error: {0}")]
    Policy(String),

    /// Session was interrupted by the peer.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// Idle transport timeout.
    #[error("transport timeout")]
    Timeout,

    /// Message could not be encoded or decoded in the negotiated format.
    #[error("encode error: {0}")]
    Encode(String),

    /// Session startup refused (existing client on --create, busy session).
    #[error("init failed: {0}")]
    InitFailed(String),
}

impl Error {
    /// True for errors that must tear down the whole session rather than
    /// roll back a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AuthFailed(_)
                | Error::Protocol(_)
                | Error::Timeout
                | Error::Interrupted(_)
                | Error::InitFailed(_)
        )
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;
