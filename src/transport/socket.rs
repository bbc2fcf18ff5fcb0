//! A framed, split socket carrying [`Envelope`]s.
//!
//! Any `AsyncRead + AsyncWrite` byte stream (TCP, in-memory duplex pipes, a TLS stream from a
//! lower layer) becomes a [`Socket`] by wrapping it in the [`LinkCodec`].

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::core::codec::LinkCodec;
use crate::core::message::Envelope;
use crate::error::{constants, ProtocolError, Result};

pub type FrameSink = Pin<Box<dyn Sink<Envelope, Error = ProtocolError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Envelope>> + Send>>;

/// Buffer size of in-memory pipes created by [`memory_pair`]
const MEMORY_PIPE_CAPACITY: usize = 64 * 1024;

pub struct Socket {
    sink: FrameSink,
    stream: FrameStream,
}

impl Socket {
    pub fn new<S>(io: S, max_frame_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, LinkCodec::new(max_frame_size)).split();
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub async fn send(&mut self, envelope: Envelope) -> Result<()> {
        self.sink.send(envelope).await
    }

    /// Next envelope; `None` once the peer closed the stream
    pub async fn recv(&mut self) -> Option<Result<Envelope>> {
        self.stream.next().await
    }

    /// Next envelope of a handshake exchange; a closed stream is a handshake failure
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Envelope> {
        match tokio::time::timeout(limit, self.stream.next()).await {
            Err(_) => Err(ProtocolError::Timeout),
            Ok(None) => Err(ProtocolError::HandshakeError(
                constants::ERR_HANDSHAKE_CLOSED.to_string(),
            )),
            Ok(Some(frame)) => frame,
        }
    }

    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

/// Two connected in-memory sockets
pub fn memory_pair(max_frame_size: usize) -> (Socket, Socket) {
    let (left, right) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
    (
        Socket::new(left, max_frame_size),
        Socket::new(right, max_frame_size),
    )
}
