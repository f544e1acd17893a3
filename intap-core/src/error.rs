//! Error taxonomy shared by both buddies.
//!
//! Mirrors the kinds called out by the protocol design rather than a deep
//! type hierarchy: `Framing` and `SocketIo` are isolated to the flow that
//! raised them, `RoutingMiss` drops the offending client, `Startup` is
//! fatal. See `local::LocalBuddy::run` / `remote::RemoteBuddy::run` for how
//! each kind is handled.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum FrameError {
    /// Fewer than 36 bytes were available before EOF while reading a header.
    ShortHeader { got: usize },
    /// Fewer than `buf_len` bytes were available before EOF while reading a payload.
    ShortPayload { expected: u32, got: usize },
    /// The first 8 bytes were not `b"INTAP11\0"`.
    BadSignature,
    /// `id` did not match any known command code.
    UnknownCommand(u16),
    /// An IP literal does not fit in the 16-byte wire field (15 ASCII bytes + NUL).
    IpTooLong,
    /// The underlying reader returned an I/O error while filling a buffer.
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::ShortHeader { got } => {
                write!(f, "short header: got {} of 36 bytes", got)
            }
            FrameError::ShortPayload { expected, got } => {
                write!(f, "short payload: got {} of {} bytes", got, expected)
            }
            FrameError::BadSignature => write!(f, "signature mismatch, not an INTAP11 frame"),
            FrameError::UnknownCommand(id) => write!(f, "unknown command id {}", id),
            FrameError::IpTooLong => write!(f, "ip literal does not fit in 16 bytes"),
            FrameError::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

#[derive(Debug)]
pub enum Error {
    Framing(FrameError),
    SocketIo(io::Error),
    RoutingMiss { origin_ip: String },
    Startup(io::Error),
    FlowIdsExhausted,
    /// The single tunnel a remote-buddy depends on went away. Fatal: there
    /// is nothing left to relay for.
    TunnelLost,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Framing(e) => write!(f, "framing error: {}", e),
            Error::SocketIo(e) => write!(f, "socket i/o error: {}", e),
            Error::RoutingMiss { origin_ip } => {
                write!(f, "no tunnel eligible for client from {}", origin_ip)
            }
            Error::Startup(e) => write!(f, "startup error: {}", e),
            Error::FlowIdsExhausted => write!(f, "flow id space exhausted"),
            Error::TunnelLost => write!(f, "tunnel connection lost"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Framing(e) => Some(e),
            Error::SocketIo(e) => Some(e),
            Error::Startup(e) => Some(e),
            Error::RoutingMiss { .. } | Error::FlowIdsExhausted | Error::TunnelLost => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::SocketIo(e)
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Framing(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
