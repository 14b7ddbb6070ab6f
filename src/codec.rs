//! The boundary between logical messages and frame bodies.

use bytes::{Bytes, BytesMut};
use rapid_tlv::RapidTlvMessage;

use crate::error::CodecError;

/// Turns messages into frame bodies and back.
///
/// `decode` returning `Ok(None)` means "not a message this side understands";
/// the dispatcher answers such requests with a not-supported reply.
pub trait Codec: Send + Sync + 'static {
    type Message: Send + 'static;

    fn encode(&self, message: Self::Message, dst: &mut BytesMut) -> Result<(), CodecError>;

    fn decode(&self, src: &[u8]) -> Result<Option<Self::Message>, CodecError>;

    /// Untagged messages travel with id 0 and take the next untagged frame as
    /// their reply, so only one can be outstanding per connection.
    fn is_identified(&self, _message: &Self::Message) -> bool {
        true
    }
}

/// Passes bodies through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Message = Bytes;

    fn encode(&self, message: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(&message);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Option<Bytes>, CodecError> {
        Ok(Some(Bytes::copy_from_slice(src)))
    }
}

/// Rapid-TLV messages as frame bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct TlvCodec {
    untagged: bool,
}

impl TlvCodec {
    pub fn new() -> Self {
        Self { untagged: false }
    }

    /// Sends every message untagged, for peers that answer strictly in turn.
    pub fn untagged() -> Self {
        Self { untagged: true }
    }
}

impl Codec for TlvCodec {
    type Message = RapidTlvMessage;

    fn encode(&self, mut message: RapidTlvMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let encoded = message
            .encode()
            .map_err(|e| CodecError::new(format!("Rapid-TLV error: {e:?}")))?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<Option<RapidTlvMessage>, CodecError> {
        if src.is_empty() {
            return Ok(None);
        }
        RapidTlvMessage::parse(Bytes::copy_from_slice(src))
            .map(Some)
            .map_err(|e| CodecError::new(format!("Rapid-TLV error: {e:?}")))
    }

    fn is_identified(&self, _message: &RapidTlvMessage) -> bool {
        !self.untagged
    }
}
