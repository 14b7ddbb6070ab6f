#![allow(dead_code)]

use bytes::BytesMut;
use rapid_mux::connection::{Dispatcher, Origin, Token, Transport, TransportOptions};
use rapid_mux::frame::{FrameHeader, FrameKind, HEADER_LEN};
use rapid_mux::{BufferPool, Codec, CodecError, MessageHandler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// UTF-8 text messages.
///
/// `!encode…` fails to encode, bodies starting with `?` decode to nothing,
/// `untagged:…` messages travel without a correlation id.
pub struct TextCodec;

impl Codec for TextCodec {
    type Message = String;

    fn encode(&self, message: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        if message.starts_with("!encode") {
            return Err(CodecError::new("refusing to encode"));
        }
        dst.extend_from_slice(message.as_bytes());
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Option<String>, CodecError> {
        if src.starts_with(b"?") {
            return Ok(None);
        }
        String::from_utf8(src.to_vec()).map(Some).map_err(CodecError::new)
    }

    fn is_identified(&self, message: &String) -> bool {
        !message.starts_with("untagged:")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Number(pub u64);

impl TryFrom<String> for Number {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map(Number)
    }
}

pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

pub fn peer_addr() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

/// A client-side token over an in-memory stream; the other end is returned raw.
pub fn token_pair(max_pending: usize) -> (Arc<Token<String>>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let transport = Transport::new(local, peer_addr(), TransportOptions::default());
    (Arc::new(Token::new(transport, Origin::Client, max_pending)), remote)
}

pub fn dispatcher<H: MessageHandler<String>>(handler: H) -> Arc<Dispatcher<TextCodec>> {
    Arc::new(Dispatcher::new(
        Arc::new(TextCodec),
        Arc::new(handler),
        Arc::new(BufferPool::new(1024, 64)),
        Duration::from_secs(5),
    ))
}

pub async fn read_frame(peer: &mut DuplexStream) -> (FrameHeader, Vec<u8>) {
    let mut head = [0u8; HEADER_LEN];
    peer.read_exact(&mut head).await.expect("frame header");
    let header = FrameHeader::parse(&head, usize::MAX).expect("valid header");
    let mut body = vec![0u8; header.body_len()];
    peer.read_exact(&mut body).await.expect("frame body");
    (header, body)
}

pub async fn write_frame(peer: &mut DuplexStream, id: i32, kind: FrameKind, body: &[u8]) {
    let mut frame = BytesMut::new();
    FrameHeader::new(id, kind, body.len()).encode_into(&mut frame);
    frame.extend_from_slice(body);
    peer.write_all(&frame).await.expect("write frame");
}
