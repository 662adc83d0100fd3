//! Read handler for accepted connections.
//!
//! Drains every byte available on read readiness and hands each chunk to a
//! [`Reassembler`]. The connection stays registered until the peer closes
//! its side or an I/O error occurs.

use crate::error::{Error, Result};
use crate::runtime::dispatcher::{Dispatcher, EventHandler, EventType, Interest};
use mio::event::Source;
use mio::net::TcpStream;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Default size of the per-connection read buffer.
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Extension point for turning raw chunks into higher-level messages.
pub trait Reassembler: Send {
    /// Called with each chunk drained from the connection, in order.
    fn push(&mut self, peer: SocketAddr, chunk: &[u8]);

    /// Called once when the connection closes.
    fn finish(&mut self, _peer: SocketAddr) {}
}

/// Builds one reassembler per accepted connection.
pub type ReassemblerFactory = Arc<dyn Fn() -> Box<dyn Reassembler> + Send + Sync>;

/// Traces each chunk and counts bytes. Nothing is retained.
#[derive(Debug, Default)]
pub struct TraceReassembler {
    received: u64,
}

impl TraceReassembler {
    /// Bytes seen since the last `finish`.
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl Reassembler for TraceReassembler {
    fn push(&mut self, peer: SocketAddr, chunk: &[u8]) {
        self.received += chunk.len() as u64;
        trace!(
            peer = %peer,
            len = chunk.len(),
            total = self.received,
            data = %String::from_utf8_lossy(chunk),
            "Received bytes"
        );
    }

    fn finish(&mut self, peer: SocketAddr) {
        debug!(peer = %peer, total = self.received, "Connection finished");
        self.received = 0;
    }
}

pub fn trace_reassembler() -> ReassemblerFactory {
    Arc::new(|| Box::new(TraceReassembler::default()) as Box<dyn Reassembler>)
}

/// Why a read burst ended.
enum Burst {
    /// Would block; wait for the next readiness event.
    Drained,
    /// Peer closed its write side.
    Eof,
}

struct ConnState {
    stream: Option<TcpStream>,
    buf: Vec<u8>,
    reassembler: Box<dyn Reassembler>,
}

/// Handler owning one accepted connection.
pub struct ConnectionHandler {
    peer: SocketAddr,
    state: Mutex<ConnState>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        buffer_size: usize,
        reassembler: Box<dyn Reassembler>,
    ) -> Self {
        Self {
            peer,
            state: Mutex::new(ConnState {
                stream: Some(stream),
                buf: vec![0u8; buffer_size.max(1)],
                reassembler,
            }),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.lock().stream.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_burst(&self) -> io::Result<Burst> {
        let mut state = self.lock();
        let ConnState {
            stream,
            buf,
            reassembler,
        } = &mut *state;

        let Some(stream) = stream.as_mut() else {
            return Ok(Burst::Eof);
        };

        loop {
            match stream.read(buf) {
                Ok(0) => return Ok(Burst::Eof),
                Ok(n) => reassembler.push(self.peer, &buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Burst::Drained),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Deregister, then drop the stream.
    fn close(&self, dispatcher: &Dispatcher) {
        dispatcher.deregister_handler(self, Interest::READ);

        let mut state = self.lock();
        if state.stream.take().is_some() {
            state.reassembler.finish(self.peer);
            debug!(peer = %self.peer, "Connection closed");
        }
    }
}

impl EventHandler for ConnectionHandler {
    fn handle_event(&self, dispatcher: &Dispatcher, event: EventType) -> Result<()> {
        if event != EventType::Read {
            return Ok(());
        }

        match self.read_burst() {
            Ok(Burst::Drained) => Ok(()),
            Ok(Burst::Eof) => {
                self.close(dispatcher);
                Ok(())
            }
            Err(e) => {
                self.close(dispatcher);
                Err(Error::Connection(e))
            }
        }
    }

    fn with_channel(&self, f: &mut dyn FnMut(&mut dyn Source) -> io::Result<()>) -> Result<()> {
        let mut state = self.lock();
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| Error::InvalidHandler(format!("connection to {} is closed", self.peer)))?;
        f(stream).map_err(Error::Connection)
    }
}
