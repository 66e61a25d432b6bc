//! Newline-delimited JSON framing.
//!
//! Each frame is one JSON object on a single line. `serde_json` never emits
//! a raw newline inside a document, so `\n` is an unambiguous delimiter.
//! Blank lines between frames are skipped.

use bytes::{BufMut, BytesMut};
use strest_core::Message;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use super::{
    BoxedReader, FramedDecoder, MessageDecoder, ProtocolError, WireProtocol,
    DEFAULT_MAX_FRAME_LENGTH,
};

const GREETING: &[u8] = b"STREST/2 JSON\n";

/// JSON-lines [`WireProtocol`].
#[derive(Debug, Clone)]
pub struct JsonProtocol {
    max_frame_length: usize,
}

impl JsonProtocol {
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for JsonProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl WireProtocol for JsonProtocol {
    fn name(&self) -> &'static str {
        "json"
    }

    fn greeting(&self) -> &'static [u8] {
        GREETING
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if json.len() > self.max_frame_length {
            return Err(ProtocolError::Encode(format!(
                "frame of {} bytes exceeds limit of {}",
                json.len(),
                self.max_frame_length
            )));
        }
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }

    fn new_decoder(&self, reader: BoxedReader) -> Box<dyn MessageDecoder> {
        Box::new(FramedDecoder::new(
            reader,
            JsonCodec::new(self.max_frame_length),
        ))
    }
}

/// Decoder turning JSON lines into [`Message`]s.
#[derive(Debug)]
pub struct JsonCodec {
    lines: LinesCodec,
}

impl JsonCodec {
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_length),
        }
    }

    fn parse(line: &str) -> Result<Message, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Decode(format!("invalid JSON frame: {e}")))
    }
}

fn lines_error(err: LinesCodecError) -> ProtocolError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            ProtocolError::Decode("frame exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) => ProtocolError::Io(e),
    }
}

impl Decoder for JsonCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.lines.decode(src).map_err(lines_error)? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return Self::parse(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.lines.decode_eof(src).map_err(lines_error)? {
                Some(line) if line.trim().is_empty() => {}
                // Trailing bytes without a newline are a truncated frame.
                Some(line) => {
                    return Self::parse(&line).map(Some).map_err(|_| {
                        ProtocolError::Decode("stream ended in the middle of a frame".to_string())
                    })
                }
                None => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strest_core::{Request, Response};
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn reader(bytes: &'static [u8]) -> BoxedReader {
        Box::new(bytes)
    }

    #[test]
    fn encode_produces_single_line() {
        let protocol = JsonProtocol::default();
        let mut request = Request::new("POST", "/notes").with_txn_id("n1");
        request.set_param("body", "line one\nline two");
        let mut buf = BytesMut::new();
        protocol.encode(&request, &mut buf).unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn decodes_consecutive_frames_and_eof() {
        let mut decoder = JsonProtocol::default().new_decoder(reader(
            b"{\"strest\":{\"txn\":{\"id\":\"a\"}}}\n\n{\"strest\":{\"txn\":{\"id\":\"b\"}}}\n",
        ));
        let first = decoder.decode_response().await.unwrap().unwrap();
        let second = decoder.decode_response().await.unwrap().unwrap();
        assert_eq!(first.txn_id(), "a");
        assert_eq!(second.txn_id(), "b");
        assert!(decoder.decode_response().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let mut decoder = JsonProtocol::default().new_decoder(reader(b"not json\n"));
        let err = decoder.decode_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[tokio::test]
    async fn non_object_frame_is_a_decode_error() {
        let mut decoder = JsonProtocol::default().new_decoder(reader(b"[1,2,3]\n"));
        let err = decoder.decode_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[tokio::test]
    async fn truncated_frame_at_eof_is_a_decode_error() {
        let mut decoder = JsonProtocol::default().new_decoder(reader(b"{\"strest\":{\"tx"));
        let err = decoder.decode_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_decode_error() {
        let protocol = JsonProtocol::new(16);
        let mut decoder =
            protocol.new_decoder(reader(b"{\"a\":\"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\"}\n"));
        let err = decoder.decode_message().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[tokio::test]
    async fn write_response_roundtrips_through_decoder() {
        let protocol = JsonProtocol::default();
        let request = Request::new("GET", "/ping").with_txn_id("rt");
        let mut response = Response::new(&request);
        response.put("data.pong", true);

        let (mut tx, rx) = tokio::io::duplex(1024);
        let written = protocol.write_response(&response, &mut tx).await.unwrap();
        assert!(written > 0);
        tx.shutdown().await.unwrap();
        drop(tx);

        let mut decoder = protocol.new_decoder(Box::new(rx));
        let decoded = decoder.decode_response().await.unwrap().unwrap();
        assert_eq!(decoded, response);
        assert!(decoder.decode_response().await.unwrap().is_none());
    }
}
