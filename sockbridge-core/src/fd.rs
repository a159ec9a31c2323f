//! Descriptor plumbing between `socket2` and `compio`.
//!
//! Every socket keeps its canonical descriptor as a [`socket2::Socket`];
//! reactor tasks work on duplicates adopted into `compio::net` types. This
//! module owns those ownership transfers plus the few `SOL_SOCKET` options
//! `socket2` does not expose.
//!
//! # Safety
//!
//! This module uses unsafe code to move raw file descriptors between owning
//! wrappers and to call `setsockopt`/`getsockopt`. Every descriptor is moved
//! exactly once, so no descriptor ends up with two owners.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

use socket2::Socket;

/// Move an owned descriptor into any fd-owning type.
///
/// Used to turn duplicated `socket2` descriptors into `compio::net`
/// streams, listeners and datagram sockets on the reactor thread.
#[inline]
#[must_use]
pub fn adopt<T: FromRawFd>(socket: Socket) -> T {
    let fd = socket.into_raw_fd();
    // SAFETY: `fd` was just released by its only owner.
    unsafe { T::from_raw_fd(fd) }
}

/// Take the descriptor back out of an fd-owning type.
#[inline]
#[must_use]
pub fn release<T: IntoRawFd>(io: T) -> Socket {
    let fd = io.into_raw_fd();
    // SAFETY: `into_raw_fd` hands over sole ownership of an open descriptor.
    unsafe { Socket::from_raw_fd(fd) }
}

/// Duplicate a descriptor and adopt the copy.
///
/// The copy shares the open socket, so `shutdown` on either side is seen by
/// both, while closing one leaves the other usable.
///
/// # Errors
///
/// Returns an error if the descriptor cannot be duplicated.
#[inline]
pub fn duplicate<T: FromRawFd>(socket: &Socket) -> io::Result<T> {
    socket.try_clone().map(adopt)
}

/// Enable or disable `SO_DONTROUTE`.
///
/// # Errors
///
/// Returns an error if the option cannot be set.
pub fn set_dont_route(socket: &Socket, on: bool) -> io::Result<()> {
    set_int(socket, libc::SO_DONTROUTE, i32::from(on))
}

/// Read `SO_DONTROUTE`.
///
/// # Errors
///
/// Returns an error if the option cannot be read.
pub fn dont_route(socket: &Socket) -> io::Result<bool> {
    get_int(socket, libc::SO_DONTROUTE).map(|v| v != 0)
}

/// Set the receive low-water mark (`SO_RCVLOWAT`).
///
/// # Errors
///
/// Returns an error if the option cannot be set.
pub fn set_recv_lowat(socket: &Socket, bytes: i32) -> io::Result<()> {
    set_int(socket, libc::SO_RCVLOWAT, bytes)
}

/// Read the receive low-water mark.
///
/// # Errors
///
/// Returns an error if the option cannot be read.
pub fn recv_lowat(socket: &Socket) -> io::Result<i32> {
    get_int(socket, libc::SO_RCVLOWAT)
}

/// Set the send low-water mark (`SO_SNDLOWAT`).
///
/// Linux reports `ENOPROTOOPT` for this option.
///
/// # Errors
///
/// Returns an error if the option cannot be set.
pub fn set_send_lowat(socket: &Socket, bytes: i32) -> io::Result<()> {
    set_int(socket, libc::SO_SNDLOWAT, bytes)
}

/// Read the send low-water mark.
///
/// # Errors
///
/// Returns an error if the option cannot be read.
pub fn send_lowat(socket: &Socket) -> io::Result<i32> {
    get_int(socket, libc::SO_SNDLOWAT)
}

fn set_int(socket: &Socket, name: libc::c_int, value: i32) -> io::Result<()> {
    let value: libc::c_int = value;
    // SAFETY: the pointer and length describe a live `c_int`.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            std::ptr::addr_of!(value).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn get_int(socket: &Socket, name: libc::c_int) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the pointer and length describe a live, writable `c_int`.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            std::ptr::addr_of_mut!(value).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};

    fn tcp_socket() -> Socket {
        Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap()
    }

    #[test]
    fn test_adopt_and_release_keep_descriptor_open() {
        let socket = tcp_socket();
        socket.bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into()).unwrap();
        socket.listen(8).unwrap();
        let expected = socket.local_addr().unwrap().as_socket().unwrap();

        let listener: std::net::TcpListener = adopt(socket);
        assert_eq!(listener.local_addr().unwrap(), expected);

        let socket = release(listener);
        assert_eq!(socket.local_addr().unwrap().as_socket().unwrap(), expected);
    }

    #[test]
    fn test_duplicate_shares_socket() {
        let socket = tcp_socket();
        socket.bind(&"127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into()).unwrap();
        let copy: std::net::TcpListener = duplicate(&socket).unwrap();
        assert_eq!(
            copy.local_addr().unwrap(),
            socket.local_addr().unwrap().as_socket().unwrap()
        );
    }

    #[test]
    fn test_dont_route_round_trip() {
        let socket = tcp_socket();
        set_dont_route(&socket, true).unwrap();
        assert!(dont_route(&socket).unwrap());
        set_dont_route(&socket, false).unwrap();
        assert!(!dont_route(&socket).unwrap());
    }

    #[test]
    fn test_recv_lowat_round_trip() {
        let socket = tcp_socket();
        set_recv_lowat(&socket, 16).unwrap();
        assert_eq!(recv_lowat(&socket).unwrap(), 16);
    }
}
