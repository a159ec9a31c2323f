//! Socket configuration options
//!
//! This module provides the option catalogue exposed through `SetOption`,
//! the queue that holds options requested before a descriptor exists, and
//! the code that applies them to an OS socket.
//!
//! Options fall in three scopes:
//! - OS options (`SO_*`) touch the descriptor, or wait in an [`OptionQueue`]
//!   until one is created.
//! - Dual-stack preferences never touch the OS and always apply at once.
//! - TLS options configure the handshake of TLS sessions only.

use smallvec::SmallVec;
use socket2::Socket;
use std::fmt;
use std::io;
use std::time::Duration;

use crate::fd;

/// Option identifiers accepted by `SetOption`.
///
/// Every option takes an integer value. Booleans are non-zero for true,
/// `Linger` is in seconds, timeouts are in milliseconds (0 disables), and
/// TLS versions use 12 for TLS 1.2 and 13 for TLS 1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// `SO_BROADCAST`
    Broadcast,
    /// `SO_REUSEADDR`
    ReuseAddr,
    /// `SO_KEEPALIVE`
    KeepAlive,
    /// `SO_LINGER`, seconds; 0 disables lingering
    Linger,
    /// `SO_OOBINLINE`
    OobInline,
    /// `SO_SNDBUF`
    SendBuffer,
    /// `SO_RCVBUF`
    ReceiveBuffer,
    /// `SO_DONTROUTE`
    DontRoute,
    /// `SO_RCVLOWAT`
    ReceiveLowWatermark,
    /// `SO_SNDLOWAT`
    SendLowWatermark,
    /// `SO_RCVTIMEO`, milliseconds
    ReceiveTimeout,
    /// `SO_SNDTIMEO`, milliseconds
    SendTimeout,
    /// Resolve and connect over IPv6 only
    Ipv6Only,
    /// Prefer an IPv6 endpoint when one resolves
    PreferIpv6,
    /// Prefer an IPv4 endpoint when one resolves
    PreferIpv4,
    /// Reject chains that fail chain-of-trust validation
    TlsVerifyPeer,
    /// Check the certificate identity against the connect hostname
    TlsVerifyHost,
    /// Lowest TLS version to negotiate (12 or 13)
    TlsMinVersion,
    /// Highest TLS version to negotiate (12 or 13)
    TlsMaxVersion,
}

/// Where an option takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionScope {
    /// Applied to the OS descriptor
    Os,
    /// Endpoint selection preference, never touches the OS
    DualStack,
    /// TLS session setting
    Tls,
}

impl SocketOption {
    /// Get the option as a string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "SO_BROADCAST",
            Self::ReuseAddr => "SO_REUSEADDR",
            Self::KeepAlive => "SO_KEEPALIVE",
            Self::Linger => "SO_LINGER",
            Self::OobInline => "SO_OOBINLINE",
            Self::SendBuffer => "SO_SNDBUF",
            Self::ReceiveBuffer => "SO_RCVBUF",
            Self::DontRoute => "SO_DONTROUTE",
            Self::ReceiveLowWatermark => "SO_RCVLOWAT",
            Self::SendLowWatermark => "SO_SNDLOWAT",
            Self::ReceiveTimeout => "SO_RCVTIMEO",
            Self::SendTimeout => "SO_SNDTIMEO",
            Self::Ipv6Only => "IPV6_ONLY",
            Self::PreferIpv6 => "PREFER_IPV6",
            Self::PreferIpv4 => "PREFER_IPV4",
            Self::TlsVerifyPeer => "TLS_VERIFY_PEER",
            Self::TlsVerifyHost => "TLS_VERIFY_HOST",
            Self::TlsMinVersion => "TLS_MIN_VERSION",
            Self::TlsMaxVersion => "TLS_MAX_VERSION",
        }
    }

    /// Where this option takes effect.
    #[must_use]
    pub const fn scope(&self) -> OptionScope {
        match self {
            Self::Ipv6Only | Self::PreferIpv6 | Self::PreferIpv4 => OptionScope::DualStack,
            Self::TlsVerifyPeer
            | Self::TlsVerifyHost
            | Self::TlsMinVersion
            | Self::TlsMaxVersion => OptionScope::Tls,
            _ => OptionScope::Os,
        }
    }
}

impl fmt::Display for SocketOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File-valued TLS options accepted by `SetTLSOptionPath`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsPathOption {
    /// PEM certificate chain presented for client authentication
    CertificateFile,
    /// PEM private key matching the certificate chain
    PrivateKeyFile,
    /// PEM bundle of additional trust anchors
    CaFile,
}

/// Negotiable TLS protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TlsVersion {
    Tls12 = 12,
    Tls13 = 13,
}

impl TlsVersion {
    /// Decode the option value (12 or 13).
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            12 => Some(Self::Tls12),
            13 => Some(Self::Tls13),
            _ => None,
        }
    }

    /// The option value for this version.
    #[must_use]
    pub const fn as_raw(&self) -> i32 {
        *self as i32
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls12 => write!(f, "TLSv1.2"),
            Self::Tls13 => write!(f, "TLSv1.3"),
        }
    }
}

/// Dual-stack endpoint preference of a socket.
///
/// The three host-visible flags are mutually exclusive, so they are stored
/// as one value: setting a flag replaces whichever was active, and clearing
/// the active flag falls back to [`DualStack::Any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DualStack {
    /// No preference; first resolver result wins
    #[default]
    Any,
    Ipv6Only,
    PreferIpv6,
    PreferIpv4,
}

impl DualStack {
    /// Apply a dual-stack option. Non-dual-stack options are ignored.
    pub fn set(&mut self, option: SocketOption, on: bool) {
        let flag = match option {
            SocketOption::Ipv6Only => Self::Ipv6Only,
            SocketOption::PreferIpv6 => Self::PreferIpv6,
            SocketOption::PreferIpv4 => Self::PreferIpv4,
            _ => return,
        };
        if on {
            *self = flag;
        } else if *self == flag {
            *self = Self::Any;
        }
    }

    /// Read back a dual-stack flag.
    #[must_use]
    pub fn get(&self, option: SocketOption) -> bool {
        matches!(
            (self, option),
            (Self::Ipv6Only, SocketOption::Ipv6Only)
                | (Self::PreferIpv6, SocketOption::PreferIpv6)
                | (Self::PreferIpv4, SocketOption::PreferIpv4)
        )
    }

    #[inline]
    #[must_use]
    pub const fn ipv6_only(&self) -> bool {
        matches!(self, Self::Ipv6Only)
    }

    #[inline]
    #[must_use]
    pub const fn prefer_ipv6(&self) -> bool {
        matches!(self, Self::PreferIpv6)
    }

    #[inline]
    #[must_use]
    pub const fn prefer_ipv4(&self) -> bool {
        matches!(self, Self::PreferIpv4)
    }

    /// Whether a freshly opened descriptor should be IPv6.
    #[inline]
    #[must_use]
    pub const fn wants_ipv6(&self) -> bool {
        matches!(self, Self::Ipv6Only | Self::PreferIpv6)
    }
}

/// An OS option requested before the descriptor existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOption {
    pub option: SocketOption,
    pub value: i32,
}

/// FIFO of OS options waiting for a descriptor.
///
/// Replayed in request order right after the descriptor is created, so a
/// later value for the same option wins.
#[derive(Debug, Default, Clone)]
pub struct OptionQueue {
    pending: SmallVec<[PendingOption; 4]>,
}

impl OptionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, option: SocketOption, value: i32) {
        self.pending.push(PendingOption { option, value });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Latest queued value for `option`, if any.
    #[must_use]
    pub fn latest(&self, option: SocketOption) -> Option<i32> {
        self.pending
            .iter()
            .rev()
            .find(|p| p.option == option)
            .map(|p| p.value)
    }

    /// Apply every queued option to `socket`, emptying the queue.
    ///
    /// Failures are collected rather than aborting the replay, so one
    /// unsupported option does not hide the rest.
    pub fn replay(&mut self, socket: &Socket) -> Vec<(SocketOption, io::Error)> {
        let mut failures = Vec::new();
        for pending in self.pending.drain(..) {
            if let Err(e) = apply(socket, pending.option, pending.value) {
                failures.push((pending.option, e));
            }
        }
        failures
    }
}

fn millis(value: i32) -> Option<Duration> {
    (value > 0).then(|| Duration::from_millis(u64::from(value.unsigned_abs())))
}

/// Apply an OS-scope option to a descriptor.
///
/// Dual-stack and TLS options are not OS options; they are accepted and
/// ignored here.
///
/// # Errors
///
/// Returns the `setsockopt` error.
pub fn apply(socket: &Socket, option: SocketOption, value: i32) -> io::Result<()> {
    let on = value != 0;
    match option {
        SocketOption::Broadcast => socket.set_broadcast(on),
        SocketOption::ReuseAddr => socket.set_reuse_address(on),
        SocketOption::KeepAlive => socket.set_keepalive(on),
        SocketOption::Linger => socket.set_linger(
            (value > 0).then(|| Duration::from_secs(u64::from(value.unsigned_abs()))),
        ),
        SocketOption::OobInline => socket.set_out_of_band_inline(on),
        SocketOption::SendBuffer => socket.set_send_buffer_size(value.max(0) as usize),
        SocketOption::ReceiveBuffer => socket.set_recv_buffer_size(value.max(0) as usize),
        SocketOption::DontRoute => fd::set_dont_route(socket, on),
        SocketOption::ReceiveLowWatermark => fd::set_recv_lowat(socket, value),
        SocketOption::SendLowWatermark => fd::set_send_lowat(socket, value),
        SocketOption::ReceiveTimeout => socket.set_read_timeout(millis(value)),
        SocketOption::SendTimeout => socket.set_write_timeout(millis(value)),
        _ => Ok(()),
    }
}

/// Read an OS-scope option back from a descriptor, in `SetOption` units.
///
/// # Errors
///
/// Returns the `getsockopt` error, or `Unsupported` for non-OS options.
pub fn read(socket: &Socket, option: SocketOption) -> io::Result<i32> {
    let flag = |b: bool| i32::from(b);
    let clamp = |n: u128| i32::try_from(n).unwrap_or(i32::MAX);
    match option {
        SocketOption::Broadcast => socket.broadcast().map(flag),
        SocketOption::ReuseAddr => socket.reuse_address().map(flag),
        SocketOption::KeepAlive => socket.keepalive().map(flag),
        SocketOption::Linger => socket
            .linger()
            .map(|l| l.map_or(0, |d| clamp(u128::from(d.as_secs())))),
        SocketOption::OobInline => socket.out_of_band_inline().map(flag),
        SocketOption::SendBuffer => socket.send_buffer_size().map(|n| clamp(n as u128)),
        SocketOption::ReceiveBuffer => socket.recv_buffer_size().map(|n| clamp(n as u128)),
        SocketOption::DontRoute => fd::dont_route(socket).map(flag),
        SocketOption::ReceiveLowWatermark => fd::recv_lowat(socket),
        SocketOption::SendLowWatermark => fd::send_lowat(socket),
        SocketOption::ReceiveTimeout => socket
            .read_timeout()
            .map(|t| t.map_or(0, |d| clamp(d.as_millis()))),
        SocketOption::SendTimeout => socket
            .write_timeout()
            .map(|t| t.map_or(0, |d| clamp(d.as_millis()))),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{option} is not an OS option"),
        )),
    }
}
