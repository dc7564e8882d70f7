use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use snafu::ResultExt as _;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{Encode, IpcError, MalformedFrame, Message};

const LENGTH_PREFIX_LEN: usize = 4;

/// Default maximum frame length, in bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frames [`Message`] envelopes.
///
/// Every frame is prefixed with a 4-byte integer, in big endian order, holding the length of the JSON-encoded envelope
/// that follows. Frames longer than the configured maximum are rejected on both encode and decode.
#[derive(Clone, Debug)]
pub struct MessageCodec {
    max_frame_len: usize,
}

impl MessageCodec {
    /// Creates a new `MessageCodec` with the default maximum frame length.
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Creates a new `MessageCodec` with the given maximum frame length.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Splits the next complete frame body off `src`, if one is buffered.
    fn split_frame(&self, src: &mut BytesMut) -> Result<Option<BytesMut>, IpcError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let frame_len = u32::from_be_bytes(prefix) as usize;
        if frame_len > self.max_frame_len {
            return Err(IpcError::FrameTooLarge {
                frame_len,
                max_frame_len: self.max_frame_len,
            });
        }

        let needed = LENGTH_PREFIX_LEN + frame_len;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        trace!(frame_len, "Decoded frame.");
        Ok(Some(src.split_to(frame_len)))
    }

    fn encode_into(&self, message: &Message, dst: &mut BytesMut) -> Result<(), IpcError> {
        let encoded = serde_json::to_vec(message).context(Encode)?;
        if encoded.len() > self.max_frame_len {
            return Err(IpcError::FrameTooLarge {
                frame_len: encoded.len(),
                max_frame_len: self.max_frame_len,
            });
        }

        dst.reserve(LENGTH_PREFIX_LEN + encoded.len());
        dst.put_u32(encoded.len() as u32);
        dst.extend_from_slice(&encoded);
        Ok(())
    }

    /// Encodes `message` as a complete frame, length prefix included.
    pub(crate) fn encode_frame(&self, message: &Message) -> Result<Bytes, IpcError> {
        let mut dst = BytesMut::new();
        self.encode_into(message, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, IpcError> {
        match self.split_frame(src)? {
            Some(frame) => serde_json::from_slice(&frame).context(MalformedFrame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = IpcError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), IpcError> {
        self.encode_into(&message, dst)
    }
}

/// Decodes frames without giving up on the stream when a frame body is malformed.
///
/// A malformed body is yielded as an error item, and decoding resumes at the next frame. Errors that leave the stream
/// out of sync, such as an oversized length prefix, still fail the decoder.
#[derive(Clone, Debug)]
pub(crate) struct FrameDecoder {
    codec: MessageCodec,
}

impl FrameDecoder {
    pub(crate) fn new(codec: MessageCodec) -> Self {
        Self { codec }
    }
}

impl Decoder for FrameDecoder {
    type Item = Result<Message, IpcError>;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, IpcError> {
        Ok(self
            .codec
            .split_frame(src)?
            .map(|frame| serde_json::from_slice(&frame).context(MalformedFrame)))
    }
}
