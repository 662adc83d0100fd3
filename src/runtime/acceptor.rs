//! Accept handler: the responder side of the handshake.
//!
//! For every inbound connection the acceptor waits for the socket to report
//! established, writes one encoded ping, half-closes its write side so the
//! remote loader sees end-of-stream, and registers a [`ConnectionHandler`]
//! for whatever the peer sends next.

use crate::error::{Error, Result};
use crate::protocols::handshake::codec::{socket_uri, HandshakeMessage, MessageKind};
use crate::runtime::connect::{self, block_until_connected};
use crate::runtime::connection::{ConnectionHandler, ReassemblerFactory};
use crate::runtime::dispatcher::{Dispatcher, EventHandler, EventType, Interest};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings applied to every accepted connection.
#[derive(Clone)]
pub struct AcceptorOptions {
    /// Version advertised in the ping.
    pub protocol_version: String,
    /// Bound on waiting for an accepted socket to be established, and on
    /// writing the ping.
    pub handshake_timeout: Duration,
    /// Read buffer size for the per-connection handler.
    pub read_buffer_size: usize,
    /// Listen backlog.
    pub backlog: i32,
    /// Set SO_REUSEPORT on the listener.
    pub reuse_port: bool,
    pub reassembler: ReassemblerFactory,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            protocol_version: "4.0".to_string(),
            handshake_timeout: Duration::from_millis(2000),
            read_buffer_size: crate::runtime::connection::DEFAULT_READ_BUFFER,
            backlog: 1024,
            reuse_port: false,
            reassembler: crate::runtime::connection::trace_reassembler(),
        }
    }
}

/// Handler owning the listening socket.
pub struct Acceptor {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    options: AcceptorOptions,
}

impl Acceptor {
    /// Bind a listener on `addr`.
    pub fn bind(addr: SocketAddr, options: AcceptorOptions) -> Result<Self> {
        let listener = connect::bind_listener(addr, options.backlog, options.reuse_port)?;
        let listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, version = %options.protocol_version, "Acceptor listening");

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            options,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listening socket. Its registration must be removed first.
    pub fn close(&self, dispatcher: &Dispatcher) {
        dispatcher.deregister_handler(self, Interest::ACCEPT);
        if self.lock().take().is_some() {
            info!(addr = %self.local_addr, "Acceptor closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept until the backlog is empty.
    fn accept_pending(&self) -> Result<Vec<(TcpStream, SocketAddr)>> {
        let guard = self.lock();
        let listener = guard
            .as_ref()
            .ok_or_else(|| Error::InvalidHandler("listener is closed".to_string()))?;

        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
        Ok(accepted)
    }

    /// Greet one connection and hand it to a read handler.
    fn greet(&self, dispatcher: &Dispatcher, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let timeout = self.options.handshake_timeout;
        block_until_connected(&stream, timeout)?;

        let message = HandshakeMessage::new(
            MessageKind::Ping,
            socket_uri(peer)?,
            socket_uri(stream.local_addr()?)?,
            format!("peer-{}", Uuid::new_v4()),
            false,
            self.options.protocol_version.clone(),
        );
        write_all_within(&mut stream, &message.encode(), timeout)?;
        stream.shutdown(Shutdown::Write)?;

        debug!(peer = %peer, peer_id = message.peer_id(), "Sent ping");

        let handler = ConnectionHandler::new(
            stream,
            peer,
            self.options.read_buffer_size,
            (self.options.reassembler)(),
        );
        dispatcher.register_handler(Arc::new(handler), Interest::READ)?;
        Ok(())
    }
}

impl EventHandler for Acceptor {
    fn handle_event(&self, dispatcher: &Dispatcher, event: EventType) -> Result<()> {
        if event != EventType::Accept {
            return Ok(());
        }

        // The listener lock is released before any registration happens.
        for (stream, peer) in self.accept_pending()? {
            debug!(peer = %peer, "Accepted connection");
            if let Err(e) = self.greet(dispatcher, stream, peer) {
                warn!(peer = %peer, error = %e, "Handshake failed, dropping connection");
            }
        }
        Ok(())
    }

    fn with_channel(&self, f: &mut dyn FnMut(&mut dyn Source) -> io::Result<()>) -> Result<()> {
        let mut guard = self.lock();
        let listener = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidHandler("listener is closed".to_string()))?;
        f(listener).map_err(Error::Connection)
    }
}

/// Write `data` to a non-blocking stream, waiting for writability as needed.
fn write_all_within(stream: &mut TcpStream, mut data: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;

    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !connect::wait_writable(stream.as_raw_fd(), remaining)? {
                    return Err(Error::Timeout(timeout));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
