//! Sockbridge Error Types
//!
//! Two layers: [`ErrorKind`] is the taxonomy delivered to handlers inside
//! `Error` events, and [`EngineError`] is what the engine's entry points
//! return to the caller.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::event::SocketId;
use crate::protocol::Protocol;

/// Error categories reported through `Error` events.
///
/// Discriminants are the values seen by the host bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// Empty hostname provided
    EmptyHost = 1,
    /// Host resolution failed, or dual-stack preferences filtered out every candidate
    NoHost = 2,
    /// Connection could not be established
    ConnectError = 3,
    /// Send operation failed
    SendError = 4,
    /// Bind operation failed
    BindError = 5,
    /// Receive operation failed
    RecvError = 6,
    /// Listen or accept failed
    ListenError = 7,
    /// TLS handshake failed
    TlsHandshakeError = 8,
    /// TLS certificate verification failed
    TlsCertificateError = 9,
    /// Negotiated or configured TLS version not acceptable
    TlsVersionError = 10,
}

impl ErrorKind {
    /// Get the error kind as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyHost => "EMPTY_HOST",
            Self::NoHost => "NO_HOST",
            Self::ConnectError => "CONNECT_ERROR",
            Self::SendError => "SEND_ERROR",
            Self::BindError => "BIND_ERROR",
            Self::RecvError => "RECV_ERROR",
            Self::ListenError => "LISTEN_ERROR",
            Self::TlsHandshakeError => "TLS_HANDSHAKE_ERROR",
            Self::TlsCertificateError => "TLS_CERT_ERROR",
            Self::TlsVersionError => "TLS_VERSION_ERROR",
        }
    }

}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Extract the platform error code carried in `Error` events.
///
/// Errors without an OS code (resolver filtering, TLS library failures)
/// report 0.
#[inline]
#[must_use]
pub fn platform_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error outside of a reported operation
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The identity does not name a live socket
    #[error("Unknown socket {0}")]
    UnknownSocket(SocketId),

    /// Operation not available for this protocol
    #[error("{operation} is not supported on {protocol} sockets")]
    Unsupported {
        operation: &'static str,
        protocol: Protocol,
    },

    /// Hostname was empty
    #[error("Empty hostname")]
    EmptyHost,

    /// Send without an open connection; a `SendError` event was queued
    #[error("Socket is not connected")]
    NotConnected,

    /// Listen called before a successful bind; a `ListenError` event was queued
    #[error("Socket is not bound")]
    NotBound,

    /// Operation failed; an `Error` event with the same kind was queued
    #[error("{kind}: {source}")]
    Operation {
        kind: ErrorKind,
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded or the TLS configuration is invalid
    #[error("TLS error: {0}")]
    Tls(String),

    /// The reactor thread is not running
    #[error("Reactor is not running")]
    ReactorUnavailable,
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Create an operation error for the given kind
    pub fn operation(kind: ErrorKind, source: io::Error) -> Self {
        Self::Operation { kind, source }
    }

    /// Create an unsupported-operation error
    pub const fn unsupported(operation: &'static str, protocol: Protocol) -> Self {
        Self::Unsupported {
            operation,
            protocol,
        }
    }

    /// Create a TLS error with a message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// The event kind reported for this failure, if one was queued.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Operation { kind, .. } => Some(*kind),
            Self::EmptyHost => Some(ErrorKind::EmptyHost),
            Self::NotConnected => Some(ErrorKind::SendError),
            Self::NotBound => Some(ErrorKind::ListenError),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_values_match_host_abi() {
        assert_eq!(ErrorKind::EmptyHost as u8, 1);
        assert_eq!(ErrorKind::NoHost as u8, 2);
        assert_eq!(ErrorKind::BindError as u8, 5);
        assert_eq!(ErrorKind::TlsVersionError as u8, 10);
    }

    #[test]
    fn test_platform_code() {
        let err = io::Error::from_raw_os_error(111);
        assert_eq!(platform_code(&err), 111);
        let err = io::Error::new(io::ErrorKind::Other, "filtered");
        assert_eq!(platform_code(&err), 0);
    }

    #[test]
    fn test_operation_error_display() {
        let err = EngineError::operation(
            ErrorKind::ConnectError,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.to_string(), "CONNECT_ERROR: refused");
        assert_eq!(err.kind(), Some(ErrorKind::ConnectError));
    }
}
