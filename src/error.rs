//! Error types for iproto-client.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::codes;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket connect, greeting or handshake failure at connect time.
    #[error("Failed to connect to {addr}: {reason}")]
    Connect {
        /// Address the connection was attempted against.
        addr: String,
        /// Human readable cause.
        reason: String,
    },

    /// Credentials rejected by the server.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Local deadline exceeded on a single request.
    #[error("Request {sync} timed out after {elapsed:?}")]
    Timeout {
        /// Correlation id of the request that timed out.
        sync: u64,
        /// Time spent waiting for the reply.
        elapsed: Duration,
    },

    /// Transport severed, or no transport is currently established.
    #[error("Connection lost: {0}")]
    Connectivity(String),

    /// Connection was closed explicitly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Object unresolvable, or the server rejected the request's schema version.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Server returned a non-success status.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Server error code (without the error flag bit).
        code: u32,
        /// Server error message, verbatim.
        message: String,
    },

    /// Payload did not have the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Protocol violation (invalid frame, oversized payload, bad greeting).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Low-level MsgPack marker write error.
    #[error("MsgPack write error: {0}")]
    MsgPackWrite(#[from] rmp::encode::ValueWriteError),

    /// Dynamic value could not be read from the wire.
    #[error("MsgPack value read error: {0}")]
    ValueRead(#[from] rmpv::decode::Error),

    /// Conversion between a dynamic value and a serde type failed.
    #[error("Value conversion error: {0}")]
    ValueConvert(#[from] rmpv::ext::Error),

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl Error {
    /// Server error code, if this is a remote error.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error means the transport is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Connectivity(_) | Error::ConnectionClosed | Error::Io(_)
        )
    }

    /// Whether a connect attempt failing with this error may be retried.
    ///
    /// Authentication failures are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connect { .. }
            | Error::Connectivity(_)
            | Error::Io(_)
            | Error::Timeout { .. } => true,
            Error::Remote { code, .. } => *code == codes::ER_LOADING,
            _ => false,
        }
    }

    /// Copy of this error for every caller that shares one outcome.
    ///
    /// Variants carrying foreign error types keep their class: I/O errors
    /// keep their kind, codec errors become [`Error::Decode`].
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::Connect { addr, reason } => Error::Connect {
                addr: addr.clone(),
                reason: reason.clone(),
            },
            Error::Auth(m) => Error::Auth(m.clone()),
            Error::Timeout { sync, elapsed } => Error::Timeout {
                sync: *sync,
                elapsed: *elapsed,
            },
            Error::Connectivity(m) => Error::Connectivity(m.clone()),
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::Schema(m) => Error::Schema(m.clone()),
            Error::Remote { code, message } => Error::Remote {
                code: *code,
                message: message.clone(),
            },
            Error::Decode(m) => Error::Decode(m.clone()),
            Error::Protocol(m) => Error::Protocol(m.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::MsgPackEncode(e) => Error::Decode(e.to_string()),
            Error::MsgPackDecode(e) => Error::Decode(e.to_string()),
            Error::MsgPackWrite(e) => Error::Decode(e.to_string()),
            Error::ValueRead(e) => Error::Decode(e.to_string()),
            Error::ValueConvert(e) => Error::Decode(e.to_string()),
            Error::BackpressureTimeout => Error::BackpressureTimeout,
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
