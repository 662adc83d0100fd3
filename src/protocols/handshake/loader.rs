//! Client side of the handshake.
//!
//! A [`PingLoader`] connects to a peer, checks the banner, reads the
//! response until the peer closes its write side, decodes it, persists it
//! and notifies listeners. Everything runs on the caller's thread; nothing
//! here touches the dispatcher.

use crate::error::{BoxError, Error, ProtocolError, Result};
use crate::protocols::handshake::codec::{HandshakeMessage, MessageKind, MAGIC};
use crate::runtime::connect::{block_until_connected, start_connect};
use bytes::BytesMut;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default bound on waiting for the connection to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default bound on reading the banner and response, from connect to end-of-stream.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(8000);

/// Default cap on the response size after the banner.
pub const DEFAULT_MAX_RESPONSE: usize = 64 * 1024;

const READ_CHUNK: usize = 512;

/// Receives decoded messages.
pub trait MessageListener: Send + Sync {
    fn on_message_received(&self, message: &HandshakeMessage);
}

impl<F> MessageListener for F
where
    F: Fn(&HandshakeMessage) + Send + Sync,
{
    fn on_message_received(&self, message: &HandshakeMessage) {
        self(message)
    }
}

/// Stores a decoded message before listeners see it.
pub trait Persist: Send + Sync {
    fn persist(&self, message: &HandshakeMessage) -> std::result::Result<(), BoxError>;
}

impl<F> Persist for F
where
    F: Fn(&HandshakeMessage) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn persist(&self, message: &HandshakeMessage) -> std::result::Result<(), BoxError> {
        self(message)
    }
}

/// Logs the message and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPersist;

impl Persist for LogPersist {
    fn persist(&self, message: &HandshakeMessage) -> std::result::Result<(), BoxError> {
        info!(
            destination = %message.destination_uri(),
            source = %message.source_uri(),
            peer_id = message.peer_id(),
            "Persisted message"
        );
        Ok(())
    }
}

/// Loads a message from a remote address and fans it out to listeners.
pub trait MessageLoader: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn MessageListener>);

    fn unregister_listener(&self, listener: &Arc<dyn MessageListener>);

    /// Fetch, decode and persist one message.
    fn load(&self, destination: SocketAddr) -> Result<HandshakeMessage>;

    /// Deliver `message` to each registered listener once.
    fn deliver(&self, message: &HandshakeMessage);

    /// `load`, then `deliver` on success.
    fn execute(&self, destination: SocketAddr) -> Result<HandshakeMessage> {
        let message = self.load(destination)?;
        self.deliver(&message);
        Ok(message)
    }
}

/// Timeouts and limits for a [`PingLoader`].
#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_response_size: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_response_size: DEFAULT_MAX_RESPONSE,
        }
    }
}

/// Observer list with identity semantics.
#[derive(Default)]
struct Listeners {
    entries: Mutex<Vec<Arc<dyn MessageListener>>>,
}

impl Listeners {
    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn MessageListener>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, listener: Arc<dyn MessageListener>) {
        let mut entries = self.lock();
        if !entries.iter().any(|l| same_listener(l, &listener)) {
            entries.push(listener);
        }
    }

    fn remove(&self, listener: &Arc<dyn MessageListener>) {
        self.lock().retain(|l| !same_listener(l, listener));
    }

    fn contains(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.lock().iter().any(|l| same_listener(l, listener))
    }

    fn snapshot(&self) -> Vec<Arc<dyn MessageListener>> {
        self.lock().clone()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

fn same_listener(a: &Arc<dyn MessageListener>, b: &Arc<dyn MessageListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Active-side protocol client.
pub struct PingLoader {
    kind: MessageKind,
    options: LoaderOptions,
    persist: Arc<dyn Persist>,
    listeners: Listeners,
}

impl PingLoader {
    pub fn new(persist: Arc<dyn Persist>) -> Self {
        Self::with_options(persist, LoaderOptions::default())
    }

    pub fn with_options(persist: Arc<dyn Persist>, options: LoaderOptions) -> Self {
        Self {
            kind: MessageKind::Ping,
            options,
            persist,
            listeners: Listeners::default(),
        }
    }

    /// Tag decoded messages as `kind` instead of `Ping`.
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Read the rest of the stream after the banner.
    ///
    /// An expired read deadline surfaces as `Error::Timeout`.
    fn read_response(&self, stream: &mut impl Read) -> Result<BytesMut> {
        let limit = self.options.max_response_size;
        let mut response = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(response),
                Ok(n) => {
                    if response.len() + n > limit {
                        return Err(ProtocolError::TooLarge(limit).into());
                    }
                    response.extend_from_slice(&chunk[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_timeout(e) => return Err(Error::Timeout(self.options.read_timeout)),
                Err(e) => return Err(Error::Connection(e)),
            }
        }
    }
}

/// Blocking reads that share one deadline.
///
/// Each read gets only the time left, so a peer trickling bytes cannot
/// stretch the call past the deadline.
struct DeadlineReader<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl<'a> DeadlineReader<'a> {
    fn new(stream: &'a TcpStream, timeout: Duration) -> Self {
        Self {
            stream,
            deadline: Instant::now() + timeout,
        }
    }
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        self.stream.set_read_timeout(Some(remaining))?;
        let mut stream = self.stream;
        stream.read(buf)
    }
}

// SO_RCVTIMEO expiry is reported as EAGAIN on unix.
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl MessageLoader for PingLoader {
    fn register_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.add(listener);
    }

    fn unregister_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners.remove(listener);
    }

    fn load(&self, destination: SocketAddr) -> Result<HandshakeMessage> {
        // The stream is dropped, and so closed, on every return path.
        let stream = start_connect(destination)?;
        block_until_connected(&stream, self.options.connect_timeout)?;
        stream.set_nonblocking(false)?;

        let mut reader = DeadlineReader::new(&stream, self.options.read_timeout);
        if !is_peer(&mut reader) {
            debug!(peer = %destination, "Banner mismatch");
            return Err(Error::NotPeer);
        }

        let response = self.read_response(&mut reader)?;
        let payload = std::str::from_utf8(&response).map_err(ProtocolError::from)?;
        let message = HandshakeMessage::decode(self.kind, payload)?;

        self.persist.persist(&message).map_err(Error::Persistence)?;

        debug!(peer = %destination, peer_id = message.peer_id(), "Loaded message");
        Ok(message)
    }

    fn deliver(&self, message: &HandshakeMessage) {
        for listener in self.listeners.snapshot() {
            // Removed since the snapshot: skip silently.
            if self.listeners.contains(&listener) {
                listener.on_message_received(message);
            }
        }
    }
}

/// Read exactly the banner and compare it with `MAGIC`.
///
/// Any read failure, including a reset or an expired deadline, means "not a peer".
fn is_peer(stream: &mut impl Read) -> bool {
    let mut banner = [0u8; MAGIC.len()];
    match stream.read_exact(&mut banner) {
        Ok(()) => &banner == MAGIC,
        Err(_) => false,
    }
}

/// Front door for callers: register a listener and ping in one step.
pub struct Messenger<L: MessageLoader> {
    loader: Arc<L>,
}

impl<L: MessageLoader + 'static> Messenger<L> {
    pub fn new(loader: Arc<L>) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Arc<L> {
        &self.loader
    }

    /// Register `listener`, then load from `destination` and notify.
    ///
    /// The listener is removed again when the call returns, whatever the
    /// outcome, so it only ever hears about this ping.
    pub fn ping(&self, destination: SocketAddr, listener: Arc<dyn MessageListener>) -> Result<HandshakeMessage> {
        scoped_execute(&*self.loader, destination, listener)
    }

    /// Like [`Messenger::ping`], on a background thread.
    pub fn spawn_ping(
        &self,
        destination: SocketAddr,
        listener: Arc<dyn MessageListener>,
    ) -> Result<JoinHandle<Result<HandshakeMessage>>> {
        let loader = Arc::clone(&self.loader);
        let handle = thread::Builder::new()
            .name(format!("ping-{destination}"))
            .spawn(move || scoped_execute(&*loader, destination, listener))?;
        Ok(handle)
    }
}

fn scoped_execute<L: MessageLoader + ?Sized>(
    loader: &L,
    destination: SocketAddr,
    listener: Arc<dyn MessageListener>,
) -> Result<HandshakeMessage> {
    loader.register_listener(Arc::clone(&listener));
    let result = loader.execute(destination);
    loader.unregister_listener(&listener);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Shutdown, TcpListener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Serve `reply` once to the next connection, then close.
    fn serve_once(reply: Vec<u8>) -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = stream.write_all(&reply);
            let _ = stream.shutdown(Shutdown::Write);
            // Hold the socket until the client closes.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });
        (addr, handle)
    }

    fn frame(payload: &str) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    struct Counter(AtomicUsize);

    impl MessageListener for Counter {
        fn on_message_received(&self, _: &HandshakeMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loader() -> PingLoader {
        PingLoader::new(Arc::new(LogPersist))
    }

    #[test]
    fn test_load_valid_response() {
        let (addr, server) = serve_once(frame("tcp://peerA tcp://peerB peer-1 0 3.0\r"));

        let message = loader().load(addr).unwrap();
        assert_eq!(message.kind(), MessageKind::Ping);
        assert_eq!(message.destination_uri().as_str(), "tcp://peerA");
        assert_eq!(message.source_uri().as_str(), "tcp://peerB");
        assert_eq!(message.peer_id(), "peer-1");
        assert!(!message.is_propagated());
        assert_eq!(message.protocol_version(), "3.0");

        // Server sees our close.
        server.join().unwrap();
    }

    #[test]
    fn test_hello_kind() {
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 1 4.0"));
        let message = loader().with_kind(MessageKind::Hello).load(addr).unwrap();
        assert_eq!(message.kind(), MessageKind::Hello);
        assert!(message.is_propagated());
        server.join().unwrap();
    }

    #[test]
    fn test_not_a_peer() {
        let (addr, server) = serve_once(b"HTTP/1.1 200 OK\r\n\r\n".to_vec());
        assert!(matches!(loader().load(addr), Err(Error::NotPeer)));
        server.join().unwrap();
    }

    #[test]
    fn test_short_banner() {
        let (addr, server) = serve_once(b"JXTA".to_vec());
        assert!(matches!(loader().load(addr), Err(Error::NotPeer)));
        server.join().unwrap();
    }

    #[test]
    fn test_wrong_field_count() {
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 0"));
        match loader().load(addr) {
            Err(Error::Protocol(ProtocolError::FieldCount(4))) => {}
            other => panic!("unexpected: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_invalid_uri() {
        let (addr, server) = serve_once(frame("/127.0.0.1:1 tcp://b id 0 4.0"));
        match loader().load(addr) {
            Err(Error::Protocol(ProtocolError::InvalidUri { .. })) => {}
            other => panic!("unexpected: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_not_utf8() {
        let mut reply = frame("tcp://a tcp://b ");
        reply.extend_from_slice(&[0xff, 0xfe]);
        reply.extend_from_slice(b" 0 4.0");
        let (addr, server) = serve_once(reply);
        match loader().load(addr) {
            Err(Error::Protocol(ProtocolError::NotUtf8(_))) => {}
            other => panic!("unexpected: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_response_too_large() {
        let options = LoaderOptions {
            max_response_size: 16,
            ..LoaderOptions::default()
        };
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 0 4.0 and a lot more"));
        let loader = PingLoader::with_options(Arc::new(LogPersist), options);
        match loader.load(addr) {
            Err(Error::Protocol(ProtocolError::TooLarge(16))) => {}
            other => panic!("unexpected: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_persistence_failure() {
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 0 4.0"));
        let persist = |_: &HandshakeMessage| -> std::result::Result<(), BoxError> {
            Err("disk full".into())
        };
        let loader = PingLoader::new(Arc::new(persist));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        loader.register_listener(counter.clone());

        match loader.execute(addr) {
            Err(Error::Persistence(e)) => assert_eq!(e.to_string(), "disk full"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_connection_refused() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        assert!(matches!(loader().load(addr), Err(Error::Connection(_))));
    }

    #[test]
    fn test_read_timeout_when_peer_never_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&frame("tcp://a tcp://b id 0 4.0")).unwrap();
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        let options = LoaderOptions {
            read_timeout: Duration::from_millis(200),
            ..LoaderOptions::default()
        };
        let start = Instant::now();
        let result = PingLoader::with_options(Arc::new(LogPersist), options).load(addr);
        assert!(matches!(result, Err(Error::Timeout(t)) if t == Duration::from_millis(200)), "{result:?}");
        assert!(start.elapsed() < Duration::from_millis(2000));
        server.join().unwrap();
    }

    #[test]
    fn test_read_deadline_covers_whole_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // Each byte arrives well inside the per-read bound.
            for byte in frame("tcp://a tcp://b id 0 4.0") {
                if stream.write_all(&[byte]).is_err() {
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });

        let options = LoaderOptions {
            read_timeout: Duration::from_millis(300),
            ..LoaderOptions::default()
        };
        let start = Instant::now();
        let result = PingLoader::with_options(Arc::new(LogPersist), options).load(addr);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
        server.join().unwrap();
    }

    #[test]
    fn test_connect_timeout() {
        let (listener, _held) = crate::runtime::connect::saturated_listener();
        let addr = listener.local_addr().unwrap();
        let options = LoaderOptions {
            connect_timeout: Duration::from_millis(300),
            ..LoaderOptions::default()
        };

        let start = Instant::now();
        let result = PingLoader::with_options(Arc::new(LogPersist), options).load(addr);
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(Error::Timeout(t)) if t == Duration::from_millis(300)), "{result:?}");
        assert!(elapsed >= Duration::from_millis(280), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
    }

    #[test]
    fn test_each_listener_notified_once() {
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 0 4.0"));
        let loader = loader();

        let first = Arc::new(Counter(AtomicUsize::new(0)));
        let second = Arc::new(Counter(AtomicUsize::new(0)));
        let first_dyn: Arc<dyn MessageListener> = first.clone();
        loader.register_listener(first_dyn.clone());
        loader.register_listener(first_dyn);
        loader.register_listener(second.clone());
        assert_eq!(loader.listener_count(), 2);

        loader.execute(addr).unwrap();
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        server.join().unwrap();
    }

    #[test]
    fn test_unregistered_listener_is_skipped() {
        let loader = Arc::new(loader());
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let counter_dyn: Arc<dyn MessageListener> = counter.clone();

        // Removes the counter while delivery is in progress.
        let remover = {
            let loader = Arc::downgrade(&loader);
            let counter_dyn = counter_dyn.clone();
            move |_: &HandshakeMessage| {
                if let Some(loader) = loader.upgrade() {
                    loader.unregister_listener(&counter_dyn);
                }
            }
        };
        loader.register_listener(Arc::new(remover));
        loader.register_listener(counter_dyn);

        let message = HandshakeMessage::decode(MessageKind::Ping, "tcp://a tcp://b id 0 4.0").unwrap();
        loader.deliver(&message);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
        assert_eq!(loader.listener_count(), 1);
    }

    #[test]
    fn test_messenger_ping() {
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 0 4.0\r"));
        let messenger = Messenger::new(Arc::new(loader()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let listener = move |m: &HandshakeMessage| sink.lock().unwrap().push(m.peer_id().to_string());
        let message = messenger.ping(addr, Arc::new(listener)).unwrap();

        assert_eq!(message.peer_id(), "id");
        assert_eq!(*seen.lock().unwrap(), vec!["id".to_string()]);
        assert_eq!(messenger.loader().listener_count(), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_ping_notifies_only_its_own_listener() {
        let messenger = Messenger::new(Arc::new(loader()));
        let first = Arc::new(Counter(AtomicUsize::new(0)));
        let second = Arc::new(Counter(AtomicUsize::new(0)));

        let (addr, server) = serve_once(frame("tcp://a tcp://b one 0 4.0"));
        messenger.ping(addr, first.clone()).unwrap();
        server.join().unwrap();

        let (addr, server) = serve_once(frame("tcp://a tcp://b two 0 4.0"));
        messenger.ping(addr, second.clone()).unwrap();
        server.join().unwrap();

        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        assert_eq!(messenger.loader().listener_count(), 0);

        // Removed on failure too.
        let (addr, server) = serve_once(b"nope".to_vec());
        assert!(matches!(messenger.ping(addr, first.clone()), Err(Error::NotPeer)));
        assert_eq!(messenger.loader().listener_count(), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_messenger_spawn_ping() {
        let (addr, server) = serve_once(frame("tcp://a tcp://b id 0 4.0"));
        let messenger = Messenger::new(Arc::new(loader()));
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        let handle = messenger.spawn_ping(addr, counter.clone()).unwrap();
        let message = handle.join().unwrap().unwrap();
        assert_eq!(message.source_uri().as_str(), "tcp://b");
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(messenger.loader().listener_count(), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_is_peer_reads_only_banner() {
        let mut input: &[u8] = b"JXTAHELLO rest";
        assert!(is_peer(&mut input));
        assert_eq!(input, b"rest");

        let mut input: &[u8] = b"JXTAHOLA! rest";
        assert!(!is_peer(&mut input));
    }

    #[test]
    fn test_stream_closed_on_failure() {
        // The server observes EOF only if the client drops its socket.
        let (addr, server) = serve_once(frame("garbage"));
        assert!(loader().load(addr).is_err());
        server.join().unwrap();
    }
}
