//! Error types for skein-transport.

use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Timeout,
    Connection,
    Tls,
    Cancelled,
    InvalidRequest,
    Io,
    Protocol,
    /// The session, connection or stream side was already closed.
    Closed,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timed out",
            TransportErrorKind::Connection => "connection failed",
            TransportErrorKind::Tls => "tls failure",
            TransportErrorKind::Cancelled => "cancelled",
            TransportErrorKind::InvalidRequest => "invalid request",
            TransportErrorKind::Io => "i/o error",
            TransportErrorKind::Protocol => "protocol error",
            TransportErrorKind::Closed => "closed",
            TransportErrorKind::Other => "transport error",
        };
        f.write_str(name)
    }
}

/// Opaque transport failure surfaced to the orchestration layer.
///
/// Cloneable so one failure can reach several callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn cancelled() -> Self { Self::new(TransportErrorKind::Cancelled, "operation cancelled") }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn is_cancelled(&self) -> bool { self.kind == TransportErrorKind::Cancelled }

    pub fn is_timeout(&self) -> bool { self.kind == TransportErrorKind::Timeout }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::TimedOut => TransportErrorKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable => TransportErrorKind::Connection,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => TransportErrorKind::Closed,
            io::ErrorKind::InvalidInput => TransportErrorKind::InvalidRequest,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, e.to_string())
    }
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connection
        } else if e.is_builder() {
            TransportErrorKind::InvalidRequest
        } else if e.is_redirect() || e.is_decode() || e.is_body() {
            TransportErrorKind::Protocol
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let timed_out: TransportError = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert!(timed_out.is_timeout());

        let refused: TransportError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused.kind, TransportErrorKind::Connection);

        let pipe: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(pipe.kind, TransportErrorKind::Closed);

        let other: TransportError = io::Error::other("boom").into();
        assert_eq!(other.kind, TransportErrorKind::Io);
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = TransportError::timeout("read took too long");
        assert_eq!(err.to_string(), "timed out: read took too long");
        assert!(TransportError::cancelled().is_cancelled());
    }
}
