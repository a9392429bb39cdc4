//! Error taxonomy for DCC operations.
//!
//! None of these are fatal to the process: the offending session is flagged
//! for deletion and the user is told. They are returned so callers (and tests)
//! can see why an operation did nothing.

/// Why a DCC operation failed.
#[derive(Debug, thiserror::Error)]
pub enum DccError {
    /// Malformed or unsafe handshake address or port. Rejected before any
    /// session is allocated.
    #[error("bad handshake address: {0}")]
    Address(String),
    /// Reserved port, truncated ack, oversized payload, duplicate offer.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Socket, accept or connect failure.
    #[error("connection error: {0}")]
    Connection(#[source] std::io::Error),
    /// Local file or remote socket write failure.
    #[error("write failed: {0}")]
    WriteFailure(#[source] std::io::Error),
    /// An offer or connect sat idle too long.
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("unknown DCC type {0}")]
    UnknownType(String),
    #[error("no matching DCC session: {0}")]
    NotFound(String),
    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, DccError>;
