//! Transport protocol tags.
//!
//! Every socket in the engine is created with exactly one protocol, fixed for
//! its whole lifetime. The numeric values match the host ABI
//! (`Tcp = 1`, `Udp = 2`, `Tls = 3`).

use std::fmt;

/// Transport protocol of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    /// Connection-oriented stream socket
    Tcp = 1,

    /// Connectionless datagram socket
    Udp = 2,

    /// TLS client session over TCP
    Tls = 3,
}

impl Protocol {
    /// Get the protocol as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Tls => "TLS",
        }
    }

    /// Decode the host-side numeric protocol value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Tcp),
            2 => Some(Self::Udp),
            3 => Some(Self::Tls),
            _ => None,
        }
    }

    /// Whether the protocol runs over a byte stream (TCP or TLS).
    #[inline]
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Tcp | Self::Tls)
    }

    /// Whether sockets of this protocol can listen and accept.
    ///
    /// TLS sessions are client-only.
    #[inline]
    #[must_use]
    pub const fn can_listen(&self) -> bool {
        matches!(self, Self::Tcp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
        assert_eq!(Protocol::Tls.to_string(), "TLS");
    }

    #[test]
    fn test_protocol_raw_values() {
        assert_eq!(Protocol::from_raw(1), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_raw(3), Some(Protocol::Tls));
        assert_eq!(Protocol::from_raw(0), None);
        assert_eq!(Protocol::Udp as u8, 2);
    }

    #[test]
    fn test_only_tcp_listens() {
        assert!(Protocol::Tcp.can_listen());
        assert!(!Protocol::Udp.can_listen());
        assert!(!Protocol::Tls.can_listen());
        assert!(Protocol::Tls.is_stream());
        assert!(!Protocol::Udp.is_stream());
    }
}
