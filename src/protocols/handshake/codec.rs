//! Handshake message and its text wire form.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use url::Url;

/// Banner opening every conformant stream: the tag plus its separator.
pub const MAGIC: &[u8; 10] = b"JXTAHELLO ";

/// Appended after the last field on encode.
pub const TERMINATOR: u8 = b'\r';

const SPACE: u8 = b' ';

/// Semantic role of a handshake message. Both kinds share one wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Sent by a responder to an inbound connection.
    Ping,
    /// Received by a peer saying hello to another.
    Hello,
}

/// Value exchanged on first contact between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    kind: MessageKind,
    destination_uri: Url,
    source_uri: Url,
    peer_id: String,
    propagated: bool,
    protocol_version: String,
}

impl HandshakeMessage {
    pub fn new(
        kind: MessageKind,
        destination_uri: Url,
        source_uri: Url,
        peer_id: impl Into<String>,
        propagated: bool,
        protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            destination_uri,
            source_uri,
            peer_id: peer_id.into(),
            propagated,
            protocol_version: protocol_version.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn destination_uri(&self) -> &Url {
        &self.destination_uri
    }

    pub fn source_uri(&self) -> &Url {
        &self.source_uri
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_propagated(&self) -> bool {
        self.propagated
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Encode the full frame: magic, the five fields, then `TERMINATOR`.
    pub fn encode(&self) -> Bytes {
        let destination = self.destination_uri.as_str();
        let source = self.source_uri.as_str();
        let len = MAGIC.len()
            + destination.len()
            + source.len()
            + self.peer_id.len()
            + self.protocol_version.len()
            + 6; // four spaces, flag, terminator

        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(MAGIC);
        buf.put_slice(destination.as_bytes());
        buf.put_u8(SPACE);
        buf.put_slice(source.as_bytes());
        buf.put_u8(SPACE);
        buf.put_slice(self.peer_id.as_bytes());
        buf.put_u8(SPACE);
        buf.put_u8(if self.propagated { b'1' } else { b'0' });
        buf.put_u8(SPACE);
        buf.put_slice(self.protocol_version.as_bytes());
        buf.put_u8(TERMINATOR);
        buf.freeze()
    }

    /// Decode the payload that follows the banner.
    ///
    /// Surrounding whitespace (including the trailing `TERMINATOR`, which is
    /// optional here) is trimmed and the rest split on single spaces.
    pub fn decode(kind: MessageKind, payload: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = payload.trim().split(' ').collect();
        Self::from_tokens(kind, &tokens)
    }

    /// Decode a complete frame, banner included.
    pub fn decode_frame(kind: MessageKind, frame: &[u8]) -> Result<Self, ProtocolError> {
        let payload = frame
            .strip_prefix(MAGIC.as_slice())
            .ok_or(ProtocolError::MissingMagic)?;
        Self::decode(kind, std::str::from_utf8(payload)?)
    }

    /// Build a message from exactly five fields in wire order.
    pub fn from_tokens(kind: MessageKind, tokens: &[&str]) -> Result<Self, ProtocolError> {
        let [destination, source, peer_id, flag, version] = tokens else {
            return Err(ProtocolError::FieldCount(tokens.len()));
        };

        Ok(Self {
            kind,
            destination_uri: parse_uri("destination", destination)?,
            source_uri: parse_uri("source", source)?,
            peer_id: (*peer_id).to_string(),
            propagated: parse_flag(flag)?,
            protocol_version: (*version).to_string(),
        })
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} dest={} src={} id={} propagated={} version={}",
            self.kind,
            self.destination_uri,
            self.source_uri,
            self.peer_id,
            self.propagated,
            self.protocol_version
        )
    }
}

/// Render a socket address the way the acceptor advertises it.
pub fn socket_uri(addr: SocketAddr) -> Result<Url, ProtocolError> {
    parse_uri("socket", &format!("tcp://{addr}"))
}

fn parse_uri(field: &'static str, token: &str) -> Result<Url, ProtocolError> {
    Url::parse(token).map_err(|source| ProtocolError::InvalidUri { field, source })
}

fn parse_flag(token: &str) -> Result<bool, ProtocolError> {
    match token {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ProtocolError::InvalidFlag(other.to_string())),
    }
}
