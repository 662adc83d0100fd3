//! Single-threaded readiness dispatcher.
//!
//! Readiness-based model: poll tells us when channels are ready, then the
//! handler owning the channel performs non-blocking I/O. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! ## Constraints
//!
//! Every handler callback runs synchronously on the loop thread. A handler
//! that blocks stalls every other channel, so handlers must keep their work
//! bounded or hand it to another thread.
//!
//! Readiness is edge-triggered: a handler must drain its channel until it
//! reports would-block or it will not be woken again for data already queued.

use crate::error::{Error, Result};
use crate::runtime::token::{Registration, RegistrationTable, WAKER_TOKEN};
use mio::event::Source;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Readiness conditions a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const ACCEPT: Interest = Interest(0b001);
    pub const READ: Interest = Interest(0b010);
    pub const WRITE: Interest = Interest(0b100);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    fn to_mio(self) -> mio::Interest {
        let readable = self.contains(Self::ACCEPT) || self.contains(Self::READ);
        match (readable, self.contains(Self::WRITE)) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            _ => mio::Interest::READABLE,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Event delivered to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Accept,
    Read,
    Write,
}

/// Owner of one channel, driven by the dispatcher.
pub trait EventHandler: Send + Sync {
    /// React to `event`. Runs on the loop thread.
    fn handle_event(&self, dispatcher: &Dispatcher, event: EventType) -> Result<()>;

    /// Lend the handler's channel to `f`.
    ///
    /// Fails with `Error::InvalidHandler` once the channel has been closed.
    fn with_channel(&self, f: &mut dyn FnMut(&mut dyn Source) -> io::Result<()>) -> Result<()>;
}

/// Handle to a dispatcher. Cheap to clone; all clones drive the same loop.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    waker: Waker,
    table: Mutex<RegistrationTable>,
    /// Taken by the loop thread on `start`.
    poll: Mutex<Option<Poll>>,
    cancelled: AtomicBool,
    events_capacity: usize,
}

/// One ready registration, readiness merged across duplicate events.
struct Ready {
    token: Token,
    registration: Registration,
    readable: bool,
    writable: bool,
}

impl Dispatcher {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    /// Create a dispatcher receiving up to `events_capacity` events per wake.
    pub fn with_capacity(events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                waker,
                table: Mutex::new(RegistrationTable::new()),
                poll: Mutex::new(Some(poll)),
                cancelled: AtomicBool::new(false),
                events_capacity: events_capacity.max(1),
            }),
        })
    }

    /// Bind `handler`'s channel to the loop for `interest`.
    ///
    /// Callable from any thread, before or after `start`.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>, interest: Interest) -> Result<Token> {
        let mut table = self.lock_table();
        let token = table.next_token();
        let registry = &self.inner.registry;

        handler
            .with_channel(&mut |source: &mut dyn Source| {
                registry.register(source, token, interest.to_mio())
            })
            .map_err(|e| match e {
                Error::InvalidHandler(reason) => Error::InvalidHandler(reason),
                other => Error::InvalidHandler(other.to_string()),
            })?;

        let token = table.insert(Registration { handler, interest });
        debug!(token = token.0, ?interest, "Handler registered");
        Ok(token)
    }

    /// Cancel every registration owned by `handler`.
    ///
    /// Matching is by identity; `interest` is informational and does not
    /// narrow the match.
    pub fn deregister_handler(&self, handler: &dyn EventHandler, interest: Interest) {
        let removed = self.lock_table().remove_handler(handler);
        if removed.is_empty() {
            return;
        }

        // A closed channel has already left the poller.
        let registry = &self.inner.registry;
        if let Err(e) = handler.with_channel(&mut |source: &mut dyn Source| registry.deregister(source)) {
            trace!(error = %e, "Channel not deregistered from poller");
        }

        debug!(count = removed.len(), ?interest, "Handler deregistered");
    }

    /// Run the loop on a dedicated thread. Does not block.
    pub fn start(&self) -> Result<JoinHandle<Result<()>>> {
        let poll = self
            .inner
            .poll
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyStarted)?;

        let dispatcher = self.clone();
        let handle = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || {
                let result = dispatcher.run(poll);
                if let Err(ref e) = result {
                    error!(error = %e, "Dispatcher failed");
                }
                result
            })?;

        Ok(handle)
    }

    /// Ask the loop to stop and wake it if it is waiting. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.waker.wake() {
            warn!(error = %e, "Failed to wake dispatcher");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Number of live registrations.
    pub fn registered_count(&self) -> usize {
        self.lock_table().len()
    }

    fn lock_table(&self) -> MutexGuard<'_, RegistrationTable> {
        // Handlers may panic on the loop thread; the table itself stays consistent.
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, mut poll: Poll) -> Result<()> {
        let mut events = Events::with_capacity(self.inner.events_capacity);
        info!(capacity = self.inner.events_capacity, "Dispatcher started");

        while !self.is_cancelled() {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Connection(e));
            }

            for ready in self.snapshot(&events) {
                self.dispatch(ready);
            }
            events.clear();
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Copy ready registrations out of the table so handlers can register
    /// and deregister freely while they run.
    fn snapshot(&self, events: &Events) -> Vec<Ready> {
        let table = self.lock_table();
        let mut ready: Vec<Ready> = Vec::new();

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable();

            if let Some(existing) = ready.iter_mut().find(|r| r.token == token) {
                existing.readable |= readable;
                existing.writable |= writable;
                continue;
            }

            match table.get(token) {
                Some(registration) => ready.push(Ready {
                    token,
                    registration: registration.clone(),
                    readable,
                    writable,
                }),
                None => trace!(token = token.0, "Event for unknown token"),
            }
        }

        ready
    }

    fn dispatch(&self, ready: Ready) {
        let interest = ready.registration.interest;
        let handler = &*ready.registration.handler;

        let order = [
            (ready.writable && interest.contains(Interest::WRITE), EventType::Write),
            (ready.readable && interest.contains(Interest::READ), EventType::Read),
            (ready.readable && interest.contains(Interest::ACCEPT), EventType::Accept),
        ];

        for (fire, event) in order {
            if !fire {
                continue;
            }
            // The handler may have been deregistered by an earlier callback.
            if !self.lock_table().is_current(ready.token, handler) {
                trace!(token = ready.token.0, ?event, "Skipping stale registration");
                return;
            }
            self.invoke(ready.token, handler, event);
        }
    }

    fn invoke(&self, token: Token, handler: &dyn EventHandler, event: EventType) {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(self, event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(token = token.0, ?event, error = %e, "Handler failed"),
            Err(_) => error!(token = token.0, ?event, "Handler panicked"),
        }
    }
}
