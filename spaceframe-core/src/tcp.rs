//! TCP socket tuning helpers.
//!
//! The stream types expose no direct setsockopt surface, so these helpers
//! drop down to the raw descriptor via `socket2`. The temporary `Socket` is
//! leaked with `mem::forget` so the descriptor is not closed out from under
//! the stream.
//!
//! # Safety
//!
//! The unsafe blocks only wrap an already-owned descriptor for the duration
//! of one call.

#![allow(unsafe_code)]

use std::io;

/// Enable or disable Nagle's algorithm on a TCP stream.
#[inline]
pub fn set_nodelay(stream: &compio::net::TcpStream, on: bool) -> io::Result<()> {
    with_sock(stream, |s| s.set_nodelay(on))
}

/// Enable or disable TCP keepalive probes on a TCP stream.
#[inline]
pub fn set_keepalive(stream: &compio::net::TcpStream, on: bool) -> io::Result<()> {
    with_sock(stream, |s| s.set_keepalive(on))
}

/// Shut down both directions of a TCP stream, waking any task blocked in a
/// read on another handle to the same descriptor.
#[inline]
pub fn shutdown(stream: &compio::net::TcpStream) -> io::Result<()> {
    with_sock(stream, |s| s.shutdown(std::net::Shutdown::Both))
}

#[cfg(unix)]
fn with_sock<F>(stream: &compio::net::TcpStream, f: F) -> io::Result<()>
where
    F: FnOnce(&socket2::Socket) -> io::Result<()>,
{
    use std::os::unix::io::{AsRawFd, FromRawFd};
    let fd = stream.as_raw_fd();
    let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
    let res = f(&sock);
    std::mem::forget(sock); // Don't close the fd
    res
}

#[cfg(windows)]
fn with_sock<F>(stream: &compio::net::TcpStream, f: F) -> io::Result<()>
where
    F: FnOnce(&socket2::Socket) -> io::Result<()>,
{
    use std::os::windows::io::{AsRawSocket, FromRawSocket};
    let raw = stream.as_raw_socket();
    let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
    let res = f(&sock);
    std::mem::forget(sock); // Don't close the socket
    res
}

#[cfg(not(any(unix, windows)))]
fn with_sock<F>(_stream: &compio::net::TcpStream, _f: F) -> io::Result<()>
where
    F: FnOnce(&socket2::Socket) -> io::Result<()>,
{
    Ok(())
}
