//! Length-prefixed `MessagePack` framing.
//!
//! Frame layout: a 4-byte big-endian payload length followed by the
//! payload, a `MessagePack` map produced by `rmp_serde::to_vec_named`.

use bytes::{BufMut, BytesMut};
use strest_core::Message;
use tokio_util::codec::{Decoder, LengthDelimitedCodec};

use super::{
    BoxedReader, FramedDecoder, MessageDecoder, ProtocolError, WireProtocol,
    DEFAULT_MAX_FRAME_LENGTH,
};

const GREETING: &[u8] = b"STREST/2 MSGPACK\n";

/// Binary [`WireProtocol`] using `MessagePack` payloads.
#[derive(Debug, Clone)]
pub struct MsgpackProtocol {
    max_frame_length: usize,
}

impl MsgpackProtocol {
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for MsgpackProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl WireProtocol for MsgpackProtocol {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn greeting(&self) -> &'static [u8] {
        GREETING
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload =
            rmp_serde::to_vec_named(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| (*len as usize) <= self.max_frame_length)
            .ok_or_else(|| {
                ProtocolError::Encode(format!(
                    "frame of {} bytes exceeds limit of {}",
                    payload.len(),
                    self.max_frame_length
                ))
            })?;
        dst.reserve(payload.len() + 4);
        dst.put_u32(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }

    fn new_decoder(&self, reader: BoxedReader) -> Box<dyn MessageDecoder> {
        Box::new(FramedDecoder::new(
            reader,
            MsgpackCodec::new(self.max_frame_length),
        ))
    }
}

/// Decoder turning length-prefixed `MessagePack` frames into [`Message`]s.
#[derive(Debug)]
pub struct MsgpackCodec {
    frames: LengthDelimitedCodec,
}

impl MsgpackCodec {
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for MsgpackCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(frame) = self
            .frames
            .decode(src)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?
        else {
            return Ok(None);
        };
        rmp_serde::from_slice(&frame)
            .map(Some)
            .map_err(|e| ProtocolError::Decode(format!("invalid msgpack frame: {e}")))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::Decode(
                "stream ended in the middle of a frame".to_string(),
            )),
        }
    }
}
