//! Socket option helpers for `std::net::TcpStream`.
//!
//! Wraps the raw fd in a borrowed `socket2::Socket`, sets the option, then
//! `mem::forget`s it so the `std::net` handle keeps ownership of the
//! descriptor — applied to blocking `std::net` sockets rather than an async
//! runtime's, since this layer is deliberately thread-blocking: a real
//! thread parks on each socket syscall rather than yielding to an executor.

#![allow(unsafe_code)]

use std::io;
use std::net::TcpStream;
use std::time::Duration;

use crate::options::TransportOptions;

/// Disables Nagle's algorithm (`TCP_NODELAY=1`), set on both ends.
pub fn enable_tcp_nodelay(stream: &TcpStream) -> io::Result<()> {
    with_socket2(stream, |sock| sock.set_nodelay(true))
}

/// Sets `SO_KEEPALIVE=1` plus the idle/interval/count tunables. Scoped to
/// non-macOS systems in the original; `socket2`'s keepalive builder already
/// no-ops unsupported fields per platform, so the single call site below is
/// kept unconditional rather than duplicated behind `cfg`.
pub fn enable_keepalive(stream: &TcpStream, options: &TransportOptions) -> io::Result<()> {
    with_socket2(stream, |sock| {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(options.keepalive_idle)
            .with_interval(options.keepalive_interval);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let keepalive = keepalive.with_retries(options.keepalive_count);
        sock.set_tcp_keepalive(&keepalive)
    })
}

/// Applies both [`enable_tcp_nodelay`] and [`enable_keepalive`] to a freshly
/// accepted or connected stream.
pub fn configure(stream: &TcpStream, options: &TransportOptions) -> io::Result<()> {
    enable_tcp_nodelay(stream)?;
    enable_keepalive(stream, options)?;
    Ok(())
}

fn with_socket2<F>(stream: &TcpStream, f: F) -> io::Result<()>
where
    F: FnOnce(&socket2::Socket) -> io::Result<()>,
{
    #[cfg(unix)]
    {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let fd = stream.as_raw_fd();
        let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
        let result = f(&sock);
        std::mem::forget(sock);
        result
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = stream.as_raw_socket();
        let sock = unsafe { socket2::Socket::from_raw_socket(raw) };
        let result = f(&sock);
        std::mem::forget(sock);
        result
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = f;
        Ok(())
    }
}

/// A zero duration means "block indefinitely" to `std::net`'s
/// `set_read_timeout`, which rejects it outright; translate accordingly.
#[must_use]
pub fn as_read_timeout(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}
