//! Endpoint resolution and dual-stack selection.
//!
//! A hostname (or literal address) plus port resolves to an ordered list of
//! candidate endpoints. [`Candidates`] then picks the one to use according to
//! the socket's [`DualStack`] preference, and remembers the resolver order so
//! TCP can fall back to the next candidate when a connect fails.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use socket2::Domain;

use crate::options::DualStack;

/// IP address family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family of a socket address.
    #[inline]
    #[must_use]
    pub const fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }

    /// Family a new descriptor is opened with when nothing has resolved yet.
    #[inline]
    #[must_use]
    pub const fn preferred(prefs: DualStack) -> Self {
        if prefs.wants_ipv6() {
            Self::V6
        } else {
            Self::V4
        }
    }

    /// The `socket2` domain for this family.
    #[inline]
    #[must_use]
    pub const fn domain(&self) -> Domain {
        match self {
            Self::V4 => Domain::IPV4,
            Self::V6 => Domain::IPV6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Which address families a resolution keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveScope {
    /// A and AAAA records in one query (TCP and TLS)
    AllFamilies,
    /// Records of one family only (UDP)
    Only(Family),
}

/// Returns true if `host` is usable for resolution.
#[inline]
#[must_use]
pub fn is_valid_host(host: &str) -> bool {
    !host.trim().is_empty()
}

/// Resolve `host:port` into candidate endpoints, in resolver order.
///
/// This blocks the calling thread on the system resolver; the reactor runs it
/// through `spawn_blocking`.
///
/// # Errors
///
/// Returns the resolver error, or `NotFound` when no address of the
/// requested scope exists.
pub fn resolve(host: &str, port: u16, scope: ResolveScope) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()?
        .filter(|addr| match scope {
            ResolveScope::AllFamilies => true,
            ResolveScope::Only(family) => Family::of(addr) == family,
        })
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no endpoint found for {host}:{port}"),
        ));
    }
    Ok(addrs)
}

/// Pick the preferred endpoint out of `addrs`.
///
/// Scans once, remembering the first IPv4 and first IPv6 endpoint, then:
/// - `Ipv6Only`: the first IPv6 endpoint, or `None` if there is none;
/// - `PreferIpv6` with an IPv6 endpoint: that endpoint;
/// - `PreferIpv4` with an IPv4 endpoint: that endpoint;
/// - otherwise the first endpoint in resolver order.
///
/// Returns the index into `addrs`.
///
/// # Examples
///
/// ```
/// use sockbridge_core::endpoint::select;
/// use sockbridge_core::options::DualStack;
/// use std::net::SocketAddr;
///
/// let addrs: Vec<SocketAddr> = vec![
///     "127.0.0.1:80".parse().unwrap(),
///     "[::1]:80".parse().unwrap(),
/// ];
/// assert_eq!(select(&addrs, DualStack::Any), Some(0));
/// assert_eq!(select(&addrs, DualStack::Ipv6Only), Some(1));
/// assert_eq!(select(&addrs[..1], DualStack::Ipv6Only), None);
/// ```
#[must_use]
pub fn select(addrs: &[SocketAddr], prefs: DualStack) -> Option<usize> {
    if addrs.is_empty() {
        return None;
    }

    let mut first_v4 = None;
    let mut first_v6 = None;
    for (i, addr) in addrs.iter().enumerate() {
        match Family::of(addr) {
            Family::V4 if first_v4.is_none() => first_v4 = Some(i),
            Family::V6 if first_v6.is_none() => first_v6 = Some(i),
            _ => {}
        }
        if first_v4.is_some() && first_v6.is_some() {
            break;
        }
    }

    match prefs {
        DualStack::Ipv6Only => first_v6,
        DualStack::PreferIpv6 if first_v6.is_some() => first_v6,
        DualStack::PreferIpv4 if first_v4.is_some() => first_v4,
        _ => Some(0),
    }
}

/// Resolved endpoints with the preferred one selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    addrs: Vec<SocketAddr>,
    selected: usize,
}

impl Candidates {
    /// Apply dual-stack selection to a resolution result.
    ///
    /// Returns `None` when the preference filters out every endpoint.
    #[must_use]
    pub fn new(addrs: Vec<SocketAddr>, prefs: DualStack) -> Option<Self> {
        let selected = select(&addrs, prefs)?;
        Some(Self { addrs, selected })
    }

    /// The preferred endpoint.
    #[inline]
    #[must_use]
    pub fn selected(&self) -> SocketAddr {
        self.addrs[self.selected]
    }

    /// Connect attempt order: the selected endpoint, then every later
    /// endpoint in resolver order, unfiltered by preference.
    pub fn attempts(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addrs[self.selected..].iter().copied()
    }
}
