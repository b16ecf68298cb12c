//! Error types for fabrpc.

use std::fmt;

use crate::transport::TransportError;

/// Error type for fabrpc operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the control-channel socket.
    Io(std::io::Error),
    /// A management URI could not be parsed or resolved.
    InvalidUri(String),
    /// Hostname does not fit in a session metadata record.
    HostnameTooLong(usize),
    /// The fabric port index is not managed by this Rpc.
    UnmanagedPort(u8),
    /// The session vector has reached its lifetime bound.
    SessionLimitExceeded,
    /// An Rpc with this app TID is already registered at the Nexus.
    HookAlreadyRegistered(u8),
    /// No session with this number exists.
    SessionNotFound(u32),
    /// The session exists but is not in the connected state.
    SessionNotConnected(u32),
    /// A datagram did not have the exact management packet size.
    BadPacketSize { expected: usize, got: usize },
    /// Invalid management packet type on the wire.
    InvalidPktType(u32),
    /// Invalid management error type on the wire.
    InvalidErrType(u32),
    /// Invalid transport kind on the wire.
    InvalidTransportType(u8),
    /// Error reported by the data-path transport.
    Transport(TransportError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidUri(uri) => write!(f, "invalid management URI: {}", uri),
            Error::HostnameTooLong(len) => {
                write!(f, "hostname too long: {} bytes", len)
            }
            Error::UnmanagedPort(port) => {
                write!(f, "fabric port {} is not managed by this Rpc", port)
            }
            Error::SessionLimitExceeded => {
                write!(f, "session limit reached for this thread")
            }
            Error::HookAlreadyRegistered(tid) => {
                write!(f, "app TID {} already registered at the Nexus", tid)
            }
            Error::SessionNotFound(num) => write!(f, "session {} not found", num),
            Error::SessionNotConnected(num) => write!(f, "session {} is not connected", num),
            Error::BadPacketSize { expected, got } => {
                write!(f, "bad packet size: expected {} bytes, got {}", expected, got)
            }
            Error::InvalidPktType(v) => write!(f, "invalid packet type: {}", v),
            Error::InvalidErrType(v) => write!(f, "invalid error type: {}", v),
            Error::InvalidTransportType(v) => write!(f, "invalid transport kind: {}", v),
            Error::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

/// Result type for fabrpc operations.
pub type Result<T> = std::result::Result<T, Error>;
