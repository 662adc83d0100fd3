//! Protocol implementations.
//!
//! - `handshake`: the peer greeting exchanged on first contact

pub mod handshake;
