//! Codec for the type-length-value framing shared by the plugin and tunnel channels

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::MAX_FRAME_SIZE;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// One type-tagged, length-delimited unit on the wire.
///
/// The tag is kept raw: which tags are valid depends on the channel the frame
/// arrived on, so interpreting it is left to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: tag (1) + length (4) = 5 bytes
    pub const HEADER_SIZE: usize = 5;

    pub fn new(tag: impl Into<u8>, payload: Bytes) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    /// Frame with a zero-length payload
    pub fn empty(tag: impl Into<u8>) -> Self {
        Self::new(tag, Bytes::new())
    }

    /// Length of the encoded frame, header included
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }
}

/// Frame codec
///
/// Format: [tag: u8][length: u32 big-endian][payload: length bytes]
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let tag = src[0];
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[1..Frame::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        let total = Frame::HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        tracing::trace!(tag, length, "Decoded frame");

        Ok(Some(Frame { tag, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = frame.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        dst.reserve(Frame::HEADER_SIZE + length);
        dst.put_u8(frame.tag);
        dst.put_u32(length as u32);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
