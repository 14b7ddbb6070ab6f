//! src/error.rs

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Boxed error returned by message handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result delivered to callers of the send paths.
///
/// Every pending request resolves to exactly one value: a reply or one of these.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NetError {
    /* ───────────── Routing ───────────── */
    #[error("No connection for {0}")]
    NotConnected(SocketAddr),

    /* ───────────── Waiting ───────────── */
    #[error("No reply within the timeout")]
    Timeout,

    #[error("Request canceled by the caller")]
    Canceled,

    #[error("Connection dropped while the request was outstanding")]
    Disconnected,

    #[error("Too many outstanding requests ({0})")]
    PendingLimit(usize),

    /* ───────────── Codec ───────────── */
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode reply: {0}")]
    Decode(String),

    #[error("Peer does not support the message")]
    NotSupported,

    /* ───────────── Application Level ───────────── */
    #[error("Peer handler failed: {0}")]
    Handler(String),

    #[error("Reply has an unexpected type")]
    UnexpectedReply,
}

/// Everything that can go wrong on the socket itself.
///
/// These never reach callers: the dispatcher turns them into a disconnect.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection unexpectedly closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout writing to socket")]
    WriteTimeout,

    #[error("Frame too large ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("A receive is already pending on this transport")]
    ReceivePending,

    #[error("Transport is disconnected")]
    Disposed,
}

/// Failure reported by a [`Codec`](crate::codec::Codec).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

impl From<CodecError> for NetError {
    fn from(e: CodecError) -> Self {
        NetError::Encode(e.0)
    }
}
