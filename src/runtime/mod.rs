//! Readiness-driven runtime.
//!
//! - `Dispatcher`: single-threaded event loop over mio (epoll/kqueue)
//! - `Acceptor`: greets inbound connections with a ping
//! - `ConnectionHandler`: drains accepted connections
//! - `connect`: bounded waits for non-blocking sockets

mod acceptor;
pub mod connect;
mod connection;
mod dispatcher;
mod token;

pub use acceptor::{Acceptor, AcceptorOptions};
pub use connection::{
    trace_reassembler, ConnectionHandler, Reassembler, ReassemblerFactory, TraceReassembler,
};
pub use dispatcher::{Dispatcher, EventHandler, EventType, Interest};

use crate::config::Config;
use crate::error::Result;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// A started responder: the loop thread plus the handles needed to stop it.
pub struct Server {
    pub dispatcher: Dispatcher,
    pub acceptor: Arc<Acceptor>,
    pub handle: JoinHandle<Result<()>>,
}

/// Bind an acceptor on the configured address and start the loop.
pub fn serve(config: &Config) -> Result<Server> {
    let dispatcher = Dispatcher::with_capacity(config.events_capacity)?;
    let acceptor = Arc::new(Acceptor::bind(config.listen, config.acceptor_options())?);
    dispatcher.register_handler(acceptor.clone(), Interest::ACCEPT)?;

    let handle = dispatcher.start()?;
    info!(addr = %acceptor.local_addr(), "Responder running");

    Ok(Server {
        dispatcher,
        acceptor,
        handle,
    })
}
