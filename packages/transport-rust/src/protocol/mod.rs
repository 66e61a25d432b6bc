//! Pluggable wire protocols.
//!
//! A [`WireProtocol`] turns STREST [`Message`]s into self-delimited frames
//! and back. The client engine and the socket server only ever talk to
//! `Arc<dyn WireProtocol>` and never look at raw bytes, so JSON and binary
//! framings can be swapped per listener or per connection.
//!
//! Every protocol starts with a greeting exchange: the client writes the
//! protocol's greeting line and the server echoes it back. A mismatch on
//! either side is a [`ProtocolError::Handshake`].

pub mod json;
pub mod msgpack;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use strest_core::{Message, Request, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead};

pub use json::JsonProtocol;
pub use msgpack::MsgpackProtocol;

/// Largest frame accepted by the built-in protocols unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A full-duplex byte stream a protocol can handshake over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Read half handed to a decoder.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Write half used for outbound frames.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Errors raised while framing, parsing, or exchanging greetings.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stateful decoder bound to one inbound stream.
#[async_trait]
pub trait MessageDecoder: Send {
    /// Waits for the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame
    /// boundary. Corrupt bytes, oversized frames, and EOF in the middle of
    /// a frame are [`ProtocolError::Decode`].
    async fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError>;

    async fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        Ok(self.decode_message().await?.map(Response::from))
    }

    async fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        Ok(self.decode_message().await?.map(Request::from))
    }
}

/// Strategy for encoding, decoding, and greeting over one framing.
#[async_trait]
pub trait WireProtocol: fmt::Debug + Send + Sync + 'static {
    /// Short name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Greeting bytes exchanged before the first frame.
    fn greeting(&self) -> &'static [u8];

    /// Appends one complete, self-delimited frame for `message` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns `Encode` if the message cannot be represented in this format.
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Wraps a read half in a decoder for this format.
    fn new_decoder(&self, reader: BoxedReader) -> Box<dyn MessageDecoder>;

    /// Client side of the greeting: send ours, expect the peer to echo it.
    async fn write_handshake(&self, stream: &mut dyn Transport) -> Result<(), ProtocolError> {
        let greeting = self.greeting();
        stream
            .write_all(greeting)
            .await
            .map_err(|e| ProtocolError::Handshake(format!("failed to send greeting: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| ProtocolError::Handshake(format!("failed to send greeting: {e}")))?;

        let mut echo = vec![0u8; greeting.len()];
        stream
            .read_exact(&mut echo)
            .await
            .map_err(|e| ProtocolError::Handshake(format!("no greeting from peer: {e}")))?;
        if echo != greeting {
            return Err(ProtocolError::Handshake(format!(
                "unexpected greeting {:?}",
                String::from_utf8_lossy(&echo)
            )));
        }
        Ok(())
    }

    /// Server side of the greeting: verify the client's, then echo it.
    async fn read_handshake(&self, stream: &mut dyn Transport) -> Result<(), ProtocolError> {
        let greeting = self.greeting();
        let mut received = vec![0u8; greeting.len()];
        stream
            .read_exact(&mut received)
            .await
            .map_err(|e| ProtocolError::Handshake(format!("no greeting from peer: {e}")))?;
        if received != greeting {
            return Err(ProtocolError::Handshake(format!(
                "unexpected greeting {:?}",
                String::from_utf8_lossy(&received)
            )));
        }
        stream.write_all(greeting).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Writes one request frame and flushes. Returns the bytes written.
    ///
    /// Callers must serialize access to `writer`; the protocol does no
    /// locking of its own.
    async fn write_request(
        &self,
        request: &Request,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<usize, ProtocolError> {
        self.write_message(request, writer).await
    }

    /// Writes one response frame and flushes. Returns the bytes written.
    async fn write_response(
        &self,
        response: &Response,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<usize, ProtocolError> {
        self.write_message(response, writer).await
    }

    async fn write_message(
        &self,
        message: &Message,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<usize, ProtocolError> {
        let mut frame = BytesMut::new();
        self.encode(message, &mut frame)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(frame.len())
    }
}

/// [`MessageDecoder`] over any `tokio-util` codec that yields messages.
pub struct FramedDecoder<C> {
    frames: FramedRead<BoxedReader, C>,
}

impl<C> FramedDecoder<C>
where
    C: Decoder<Item = Message, Error = ProtocolError>,
{
    pub fn new(reader: BoxedReader, codec: C) -> Self {
        Self {
            frames: FramedRead::new(reader, codec),
        }
    }
}

#[async_trait]
impl<C> MessageDecoder for FramedDecoder<C>
where
    C: Decoder<Item = Message, Error = ProtocolError> + Send,
{
    async fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        self.frames.next().await.transpose()
    }
}

/// Error for an unrecognized protocol name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown wire protocol '{0}' (expected 'json' or 'msgpack')")]
pub struct UnknownProtocol(pub String);

/// Names the built-in protocols, for configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolKind {
    /// Newline-delimited JSON objects.
    #[default]
    Json,
    /// Length-prefixed `MessagePack` maps.
    Msgpack,
}

impl ProtocolKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Msgpack => "msgpack",
        }
    }

    /// Builds the protocol with the default frame limit.
    #[must_use]
    pub fn into_protocol(self) -> Arc<dyn WireProtocol> {
        self.with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Builds the protocol, rejecting frames larger than `max_frame_length`.
    #[must_use]
    pub fn with_max_frame_length(self, max_frame_length: usize) -> Arc<dyn WireProtocol> {
        match self {
            Self::Json => Arc::new(JsonProtocol::new(max_frame_length)),
            Self::Msgpack => Arc::new(MsgpackProtocol::new(max_frame_length)),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "binary" => Ok(Self::Msgpack),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
