//! Callback events.
//!
//! Every completion on the reactor thread ends as one [`CallbackEvent`]
//! bound to the [`SocketId`] that produced it. Events own their payloads so
//! they can cross from the reactor to the consumer thread without borrowing
//! from the operation that created them.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

use crate::error::ErrorKind;

/// Opaque identity of a registered socket.
///
/// Identities are never reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Wrap a raw identity value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identity value handed to the host.
    #[inline]
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event categories a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Connected = 0,
    Disconnected = 1,
    Accepted = 2,
    DataReceived = 3,
    SendQueueDrained = 4,
    Error = 5,
}

impl EventKind {
    /// Number of event kinds.
    pub const COUNT: usize = 6;

    /// All kinds, in discriminant order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Connected,
        Self::Disconnected,
        Self::Accepted,
        Self::DataReceived,
        Self::SendQueueDrained,
        Self::Error,
    ];

    /// Slot of this kind in per-socket handler tables.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        *self as usize
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected events",
            Self::Disconnected => "disconnected events",
            Self::Accepted => "accepted events",
            Self::DataReceived => "data events",
            Self::SendQueueDrained => "drained events",
            Self::Error => "error events",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket completion delivered to the consumer thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// Connection (and TLS handshake, if any) completed
    Connected,

    /// Connection closed locally or by the peer
    Disconnected,

    /// Listener accepted a connection, registered as `child`
    Accepted { child: SocketId, remote: SocketAddr },

    /// Bytes read from the socket, exactly as received
    DataReceived(Bytes),

    /// Every outstanding send on the socket has completed
    SendQueueDrained,

    /// An operation failed
    Error { kind: ErrorKind, code: i32 },
}

impl CallbackEvent {
    /// Create an error event.
    #[inline]
    #[must_use]
    pub const fn error(kind: ErrorKind, code: i32) -> Self {
        Self::Error { kind, code }
    }

    /// The handler slot this event is dispatched to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Accepted { .. } => EventKind::Accepted,
            Self::DataReceived(_) => EventKind::DataReceived,
            Self::SendQueueDrained => EventKind::SendQueueDrained,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

impl fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Accepted { child, remote } => write!(f, "Accepted {child} from {remote}"),
            Self::DataReceived(data) => write!(f, "Received {} bytes", data.len()),
            Self::SendQueueDrained => write!(f, "Send queue drained"),
            Self::Error { kind, code } => write!(f, "Error {kind} (code {code})"),
        }
    }
}
