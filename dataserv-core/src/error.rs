//! Domain-specific error types for the dataserv protocol.
//!
//! All fallible operations return `Result<T, Error>`.
//! Network input never panics — every wire-level failure is typed and
//! terminates only the offending connection.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The canonical error type for the dataserv protocol.
#[derive(Debug, Error)]
pub enum Error {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The negotiation byte did not map to a known connection role.
    #[error("unknown negotiation role: {value:#04x}")]
    UnknownRole { value: u8 },

    /// A peer sent a message that violates the protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A frame length prefix exceeds the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream ended mid-frame with {buffered} buffered bytes")]
    IncompleteStream { buffered: usize },

    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A mutation record in a received log references an invalid index.
    #[error("invalid {op} record at index {index}")]
    InvalidMutation { op: &'static str, index: usize },

    /// A remote log was merged into a container with unflushed local
    /// mutations.
    #[error("merge target has unflushed local mutations")]
    DirtyMergeTarget,

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer closed the connection between frames.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The data server could not be reached.
    #[error("data server unreachable at {addr}")]
    ServerUnreachable { addr: String },

    /// A channel or queue was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    // ── Conflict / Capacity Errors ───────────────────────────────
    /// A second source tried to attach to a data set that already has
    /// an active source.
    #[error("data set already has an active source")]
    SourceConflict,

    /// A coalesced diff backlog grew past the configured cap.
    #[error("coalesced backlog of {ops} mutation records exceeds cap of {max}")]
    CapacityExceeded { ops: usize, max: usize },

    // ── Client Lifecycle Errors ──────────────────────────────────
    /// The client handle is not connected.
    #[error("client is not connected")]
    NotConnected,

    /// `connect()` was called on an already-connected handle.
    #[error("client is already connected")]
    AlreadyConnected,
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        Error::Encoding(e.to_string())
    }
}
