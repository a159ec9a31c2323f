//! Integration tests for socket options applied to real descriptors

use sockbridge_core::options::{self, DualStack, OptionQueue, OptionScope, SocketOption};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

fn tcp_socket() -> Socket {
    Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
}

#[test]
fn test_queued_reuse_addr_applies_before_bind() {
    let mut queue = OptionQueue::new();
    queue.push(SocketOption::ReuseAddr, 1);
    assert_eq!(queue.len(), 1);

    // Descriptor is created later, at bind time
    let socket = tcp_socket();
    assert!(queue.replay(&socket).is_empty());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    socket.bind(&addr.into()).unwrap();

    assert_eq!(options::read(&socket, SocketOption::ReuseAddr).unwrap(), 1);
}

#[test]
fn test_bool_options_round_trip() {
    let socket = tcp_socket();
    for option in [
        SocketOption::KeepAlive,
        SocketOption::OobInline,
        SocketOption::DontRoute,
    ] {
        options::apply(&socket, option, 1).unwrap();
        assert_eq!(options::read(&socket, option).unwrap(), 1, "{option}");
        options::apply(&socket, option, 0).unwrap();
        assert_eq!(options::read(&socket, option).unwrap(), 0, "{option}");
    }
}

#[test]
fn test_broadcast_on_datagram_socket() {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
    options::apply(&socket, SocketOption::Broadcast, 1).unwrap();
    assert_eq!(options::read(&socket, SocketOption::Broadcast).unwrap(), 1);
}

#[test]
fn test_buffer_sizes_are_at_least_requested() {
    let socket = tcp_socket();
    options::apply(&socket, SocketOption::SendBuffer, 65536).unwrap();
    options::apply(&socket, SocketOption::ReceiveBuffer, 65536).unwrap();

    // The kernel may round up (Linux doubles the value)
    assert!(options::read(&socket, SocketOption::SendBuffer).unwrap() >= 65536);
    assert!(options::read(&socket, SocketOption::ReceiveBuffer).unwrap() >= 65536);
}

#[test]
fn test_send_timeout_in_millis() {
    let socket = tcp_socket();
    options::apply(&socket, SocketOption::SendTimeout, 250).unwrap();
    assert_eq!(options::read(&socket, SocketOption::SendTimeout).unwrap(), 250);
}

#[test]
fn test_non_os_options_never_touch_descriptor() {
    let socket = tcp_socket();
    for option in [
        SocketOption::Ipv6Only,
        SocketOption::PreferIpv4,
        SocketOption::TlsVerifyPeer,
        SocketOption::TlsMinVersion,
    ] {
        assert_ne!(option.scope(), OptionScope::Os);
        options::apply(&socket, option, 1).unwrap();
    }
}

#[test]
fn test_prefer_flags_are_mutually_exclusive() {
    let mut prefs = DualStack::default();
    prefs.set(SocketOption::PreferIpv6, true);
    prefs.set(SocketOption::PreferIpv4, true);

    assert!(!prefs.get(SocketOption::PreferIpv6));
    assert!(prefs.get(SocketOption::PreferIpv4));
    assert!(!prefs.get(SocketOption::Ipv6Only));
}
