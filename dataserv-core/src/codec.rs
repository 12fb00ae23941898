//! Length-prefixed wire framing.
//!
//! Every message is an 8-byte little-endian length prefix followed by
//! exactly that many payload bytes. A zero-length frame is the
//! keepalive; the decode boundary surfaces it as its own variant so
//! callers never test payloads for emptiness ad hoc.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Size of the length prefix in bytes.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on a single frame payload. Anything larger is treated
/// as a protocol violation rather than an allocation request.
pub const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An empty frame. Carries no data, proves the peer is alive.
    Keepalive,
    /// A frame with payload bytes.
    Payload(Bytes),
}

impl Frame {
    /// Payload length, zero for keepalives.
    pub fn len(&self) -> usize {
        match self {
            Frame::Keepalive => 0,
            Frame::Payload(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        if payload.is_empty() {
            Frame::Keepalive
        } else {
            Frame::Payload(payload)
        }
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Bytes::from(payload).into()
    }
}

/// Codec for the dataserv frame format, usable with `Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&src[..HEADER_SIZE]);
        let size = u64::from_le_bytes(header);

        if size > MAX_FRAME_SIZE as u64 {
            return Err(Error::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        let size = size as usize;

        if src.len() < HEADER_SIZE + size {
            src.reserve(HEADER_SIZE + size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(size).freeze();
        Ok(Some(payload.into()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::IncompleteStream {
                buffered: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let payload = match frame {
            Frame::Keepalive => Bytes::new(),
            Frame::Payload(b) => b,
        };
        if payload.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: payload.len() as u64,
                max: MAX_FRAME_SIZE,
            });
        }
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u64_le(payload.len() as u64);
        dst.put_slice(&payload);
        Ok(())
    }
}
