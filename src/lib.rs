//! Request/response messaging over multiplexed TCP connections.
//!
//! A [`Client`] or [`Server`] wraps every socket in a
//! [`Token`](connection::Token) that tracks in-flight requests by correlation
//! id. Replies are routed back to their waiting caller; everything else goes
//! to the [`MessageHandler`] and its response is written back on the same
//! connection. Message bodies are opaque and produced by a [`Codec`].

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod frame;
pub mod handler;
pub mod mux_log;
pub mod ping;
pub mod pool;
pub mod server;

/* Re-exports */
pub use client::Client;
pub use codec::{BytesCodec, Codec, TlvCodec};
pub use config::{ClientConfig, NetConfig, ServerConfig};
pub use error::{BoxError, CodecError, NetError, TransportError};
pub use event::{ClientEvent, ServerEvent};
pub use handler::{MessageHandler, Unsupported};
pub use pool::{BufferPool, PooledBuffer};
pub use server::{Server, ServerError};
pub use rapid_tlv::RapidTlvMessage;
pub use tokio_util::sync::CancellationToken;
