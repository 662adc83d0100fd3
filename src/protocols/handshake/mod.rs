//! Handshake protocol.
//!
//! First contact between peers. The responder writes one line and closes its
//! write side; the initiator checks the banner, reads to end-of-stream and
//! decodes five space-separated fields:
//!
//! ```text
//! JXTAHELLO <destination-uri> <source-uri> <peer-id> <1|0> <protocol-version>\r
//! ```
//!
//! The first ten bytes (`"JXTAHELLO "`) are the magic banner. Anything else
//! in that position means the remote end is not a peer.

pub mod codec;
pub mod loader;

pub use codec::{HandshakeMessage, MessageKind, MAGIC};
pub use loader::{
    LoaderOptions, LogPersist, MessageListener, MessageLoader, Messenger, Persist, PingLoader,
};
