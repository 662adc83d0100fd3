//! peer-reactor: a readiness-driven event dispatcher and the peer handshake
//! protocol built on it.
//!
//! - `runtime`: dispatcher, acceptor and connection handlers
//! - `protocols::handshake`: wire codec and the client ping loader

pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use error::{Error, ProtocolError, Result};
