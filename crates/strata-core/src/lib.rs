//! Strata core primitives and shared types.
//!
//! Everything both halves of the engine need: the error kinds, the wire
//! message catalog, the framed transport with its negotiated encodings and
//! compressors, and small id/time/logging helpers.

#![deny(unsafe_code)]

pub mod error;
pub mod framing;
pub mod ids;
pub mod logging;
pub mod wire;

pub use error::Error;

/// Version of the strata core library, reported in the BACKUP handshake.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Classification values for a file presented in a DIR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Nothing to do; the prior version covers this file.
    Done,
    /// Full content requested.
    Content,
    /// Ask the client to hash the file; it may still match.
    Cksum,
    /// Delta against the prior version requested.
    Delta,
    /// Full rewrite of a file that would otherwise delta.
    Refresh,
    /// Hard link resolved against an inode already seen this session.
    Linked,
}
