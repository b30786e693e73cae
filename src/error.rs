//! Runtime error taxonomy.
//!
//! A flat enum with a hand-written `Display`, no `thiserror`. Covers the
//! protocol/resource/cancellation error buckets, converging at a single
//! conversion into [`crate::status::Status`] — the one place that
//! guarantees whatever escapes the handler chain is mapped to a valid
//! gRPC status before reaching the wire.

use std::fmt;
use std::io;

use crate::frame::Http2ErrorCode;
use crate::status::{Code, Status};

#[derive(Debug)]
pub enum GrpcRuntimeError {
    Io(io::Error),

    /// Connection-scope protocol violation; carries the HTTP/2 error code to
    /// send in GOAWAY.
    ConnectionProtocol(Http2ErrorCode, String),

    /// Stream-scope protocol violation; carries the HTTP/2 error code to send
    /// in RST_STREAM.
    StreamProtocol(Http2ErrorCode, String),

    /// Resource-bound violation (message too large, too many concurrent
    /// streams, queue full) — surfaced as a gRPC status, never torn down
    /// the connection.
    ResourceBound(Status),

    /// Cancellation: client RST_STREAM(CANCEL), deadline expiry, or server
    /// shutdown.
    Cancelled(CancelReason),

    /// Anything a handler raised explicitly.
    Status(Status),

    /// Caught by the recovery interceptor.
    HandlerPanic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    ClientReset,
    DeadlineExpired,
    ServerShutdown,
}

impl fmt::Display for GrpcRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::ConnectionProtocol(code, msg) => {
                write!(f, "connection protocol error ({code:?}): {msg}")
            }
            Self::StreamProtocol(code, msg) => {
                write!(f, "stream protocol error ({code:?}): {msg}")
            }
            Self::ResourceBound(status) => write!(f, "resource bound exceeded: {status}"),
            Self::Cancelled(reason) => write!(f, "cancelled: {reason:?}"),
            Self::Status(status) => write!(f, "{status}"),
            Self::HandlerPanic(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

impl std::error::Error for GrpcRuntimeError {}

impl From<io::Error> for GrpcRuntimeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<Status> for GrpcRuntimeError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl GrpcRuntimeError {
    /// Map any runtime error to the gRPC status that terminates the RPC.
    pub fn into_status(self, debug_mode: bool) -> Status {
        match self {
            Self::Status(status) => status,
            Self::ResourceBound(status) => status,
            Self::Cancelled(CancelReason::ClientReset) => Status::cancelled("stream reset by client"),
            Self::Cancelled(CancelReason::DeadlineExpired) => {
                Status::deadline_exceeded("deadline exceeded")
            }
            Self::Cancelled(CancelReason::ServerShutdown) => {
                Status::unavailable("server is shutting down")
            }
            Self::Io(err) => {
                if debug_mode {
                    Status::unavailable(format!("I/O failure: {err}"))
                } else {
                    Status::unavailable("I/O failure")
                }
            }
            Self::ConnectionProtocol(_, msg) | Self::StreamProtocol(_, msg) => {
                if debug_mode {
                    Status::internal(msg)
                } else {
                    Status::internal("protocol error")
                }
            }
            Self::HandlerPanic(msg) => {
                if debug_mode {
                    Status::internal(msg)
                } else {
                    Status::internal("internal error")
                }
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, GrpcRuntimeError>;

/// Errors specific to HPACK decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    IntegerOverflow,
    HuffmanDecodingError,
    InvalidIndex(u64),
    UnexpectedEndOfBlock,
    PseudoHeaderAfterRegular,
    TableSizeUpdateTooLarge,
}

impl fmt::Display for HpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntegerOverflow => write!(f, "HPACK integer overflow"),
            Self::HuffmanDecodingError => write!(f, "HPACK Huffman decoding error"),
            Self::InvalidIndex(i) => write!(f, "HPACK invalid table index: {i}"),
            Self::UnexpectedEndOfBlock => write!(f, "HPACK header block ended unexpectedly"),
            Self::PseudoHeaderAfterRegular => {
                write!(f, "pseudo-header field appeared after a regular header field")
            }
            Self::TableSizeUpdateTooLarge => {
                write!(f, "dynamic table size update exceeds SETTINGS_HEADER_TABLE_SIZE")
            }
        }
    }
}

impl std::error::Error for HpackError {}

/// Errors specific to frame decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    FrameSizeError,
    ProtocolError(String),
    CompressionError(HpackError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameSizeError => write!(f, "frame size error"),
            Self::ProtocolError(msg) => write!(f, "protocol error: {msg}"),
            Self::CompressionError(err) => write!(f, "compression error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<HpackError> for FrameError {
    fn from(err: HpackError) -> Self {
        Self::CompressionError(err)
    }
}
