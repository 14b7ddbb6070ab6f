//! Minimal framing beneath the codec.
//!
//! ```text
//! [len: u32 BE][correlation id: i32 BE][kind: u8][body ...]
//! ```
//! `len` covers the whole frame, header included.

use bytes::{BufMut, BytesMut};

use crate::error::TransportError;

pub const HEADER_LEN: usize = 9;

/// Correlation id carried by frames that do not belong to a tracked request.
pub const UNIDENTIFIED: i32 = 0;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Message = 0,
    OneWay = 1,
    Ping = 2,
    Pong = 3,
    NotSupported = 4,
    HandlerError = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => FrameKind::Message,
            1 => FrameKind::OneWay,
            2 => FrameKind::Ping,
            3 => FrameKind::Pong,
            4 => FrameKind::NotSupported,
            5 => FrameKind::HandlerError,
            other => return Err(TransportError::Protocol(format!("unknown frame kind 0x{other:02X}"))),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub id: i32,
    pub kind: FrameKind,
}

impl FrameHeader {
    pub fn new(id: i32, kind: FrameKind, body_len: usize) -> Self {
        Self { len: (HEADER_LEN + body_len) as u32, id, kind }
    }

    /// Zero for a header whose length has not been patched yet.
    pub fn body_len(&self) -> usize {
        (self.len as usize).saturating_sub(HEADER_LEN)
    }

    pub fn parse(raw: &[u8; HEADER_LEN], max_frame_size: usize) -> Result<Self, TransportError> {
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let id = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let kind = FrameKind::try_from(raw[8])?;

        if (len as usize) < HEADER_LEN {
            return Err(TransportError::Protocol(format!("frame length {len} shorter than header")));
        }
        if len as usize > max_frame_size {
            return Err(TransportError::FrameTooLarge(len as usize));
        }
        Ok(Self { len, id, kind })
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN);
        dst.put_u32(self.len);
        dst.put_i32(self.id);
        dst.put_u8(self.kind as u8);
    }
}

/// Starts a frame whose body is appended afterwards; finish with [`patch_len`].
pub fn begin(dst: &mut BytesMut, id: i32, kind: FrameKind) {
    FrameHeader { len: 0, id, kind }.encode_into(dst);
}

/// Writes the final length into a frame started at offset 0 of `dst`.
pub fn patch_len(dst: &mut BytesMut) {
    let len = (dst.len() as u32).to_be_bytes();
    dst[..4].copy_from_slice(&len);
}

/// A complete frame with a text or empty body.
pub fn control(dst: &mut BytesMut, id: i32, kind: FrameKind, text: &str) {
    FrameHeader::new(id, kind, text.len()).encode_into(dst);
    dst.extend_from_slice(text.as_bytes());
}

/// Splits a captured byte stream back into `(header, body)` pairs.
///
/// Stops at the first incomplete or malformed frame and returns what it has.
pub fn split_frames(mut raw: &[u8], max_frame_size: usize) -> Vec<(FrameHeader, Vec<u8>)> {
    let mut frames = Vec::new();
    while raw.len() >= HEADER_LEN {
        let mut head = [0u8; HEADER_LEN];
        head.copy_from_slice(&raw[..HEADER_LEN]);
        let Ok(header) = FrameHeader::parse(&head, max_frame_size) else {
            break;
        };
        let len = header.len as usize;
        if raw.len() < len {
            break;
        }
        frames.push((header, raw[HEADER_LEN..len].to_vec()));
        raw = &raw[len..];
    }
    frames
}
