//! Error types shared by the dispatcher and the handshake client.

use std::io;
use std::time::Duration;

/// Boxed error returned by injected collaborators (persistence callbacks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the runtime and the handshake protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A handler could not be registered (its channel is closed or invalid).
    #[error("invalid handler: {0}")]
    InvalidHandler(String),

    /// The remote end did not open the stream with the magic banner.
    #[error("remote end is not a peer")]
    NotPeer,

    /// A connect or response deadline expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote end sent a malformed handshake.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The persistence callback rejected the decoded message.
    #[error("unable to persist message: {0}")]
    Persistence(#[source] BoxError),

    /// Socket level I/O failure.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// `Dispatcher::start` was called more than once.
    #[error("dispatcher already started")]
    AlreadyStarted,
}

/// Ways a handshake payload can be malformed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("wrong number of fields: expected 5, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} uri: {source}")]
    InvalidUri {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid propagated flag {0:?}, expected \"1\" or \"0\"")]
    InvalidFlag(String),

    #[error("response is not valid utf-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("frame does not start with the magic tag")]
    MissingMagic,

    #[error("response exceeds {0} bytes")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
