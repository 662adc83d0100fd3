//! Socket setup helpers: listener binding, non-blocking connect and
//! bounded waits for a socket to become connected or writable.
//!
//! Waiting uses `poll(2)` on the socket itself, so a non-blocking connect is
//! observed through the kernel's completion notification rather than by
//! sleeping and rechecking.

use crate::error::{Error, Result};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// A TCP socket whose connection state can be inspected.
///
/// Implemented for both std and mio streams so the client and the acceptor
/// share one wait primitive.
pub trait PendingSocket: AsRawFd {
    fn take_error(&self) -> io::Result<Option<io::Error>>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
}

impl PendingSocket for std::net::TcpStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        std::net::TcpStream::take_error(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        std::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        std::net::TcpStream::shutdown(self, how)
    }
}

impl PendingSocket for mio::net::TcpStream {
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }
}

/// Block until `socket` reports a fully established connection.
///
/// On expiry the socket is shut down in both directions and `Error::Timeout`
/// is returned; the caller never waits past `timeout`. A connect that fails
/// outright surfaces as `Error::Connection`.
pub fn block_until_connected<S: PendingSocket>(socket: &S, timeout: Duration) -> Result<()> {
    if !wait_writable(socket.as_raw_fd(), timeout)? {
        let _ = socket.shutdown(Shutdown::Both);
        return Err(Error::Timeout(timeout));
    }

    if let Some(e) = socket.take_error()? {
        return Err(Error::Connection(e));
    }

    // Writable without a pending error but no peer means the connect was
    // reset before completing.
    socket.peer_addr()?;
    Ok(())
}

/// Wait up to `timeout` for `fd` to accept writes.
///
/// Returns `Ok(false)` when the deadline passes first. Error and hang-up
/// conditions count as ready so the caller can inspect the socket error.
pub fn wait_writable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };

        // Round up so a sub-millisecond remainder still waits.
        let millis = remaining.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128);

        let rc = unsafe { libc::poll(&mut pfd, 1, millis as libc::c_int) };
        match rc {
            0 => return Ok(false),
            n if n > 0 => return Ok(true),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
        }
    }
}

/// Start a non-blocking connect to `addr`.
///
/// The returned stream is still non-blocking and may not be connected yet;
/// pair with [`block_until_connected`].
pub fn start_connect(addr: SocketAddr) -> Result<std::net::TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_nonblocking(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(Error::Connection(e)),
    }

    Ok(socket.into())
}

/// Bind a non-blocking TCP listener on `addr`.
pub fn bind_listener(addr: SocketAddr, backlog: i32, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// A listener that never accepts, connected to until its accept queue is
/// full. Further connects to it stay pending because the kernel drops their
/// SYNs. The returned streams hold the queue full.
#[cfg(test)]
pub(crate) fn saturated_listener() -> (std::net::TcpListener, Vec<std::net::TcpStream>) {
    let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 0, false).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut held = Vec::new();
    for _ in 0..64 {
        let stream = start_connect(addr).unwrap();
        match block_until_connected(&stream, Duration::from_millis(200)) {
            Ok(()) => held.push(stream),
            Err(Error::Timeout(_)) => return (listener, held),
            Err(e) => panic!("unexpected connect error: {e:?}"),
        }
    }
    panic!("accept queue never filled");
}
