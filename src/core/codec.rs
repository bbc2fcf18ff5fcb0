//! Length-delimited JSON framing for [`Envelope`]s.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document. Frames larger than
//! the configured maximum are rejected before allocation. An oversized inbound frame is a
//! [`ProtocolError::SchemaViolation`], an oversized outbound one a
//! [`ProtocolError::FrameTooLarge`]; both end the session.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::config::MAX_FRAME_SIZE;
use crate::core::message::Envelope;
use crate::error::{ProtocolError, Result};

pub struct LinkCodec {
    frames: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl Default for LinkCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl LinkCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_size)
                .new_codec(),
            max_frame_size,
        }
    }
}

impl Decoder for LinkCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        let frame = self.frames.decode(src).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => {
                ProtocolError::SchemaViolation(format!("frame rejected: {e}"))
            }
            _ => ProtocolError::Io(e),
        })?;
        match frame {
            Some(frame) => serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| ProtocolError::SchemaViolation(format!("malformed envelope: {e}"))),
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for LinkCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }
        self.frames.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::message::MessageKind;
    use bytes::BufMut;

    #[test]
    fn test_frame_roundtrip() {
        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Envelope::heartbeat(7), &mut buf).unwrap();
        codec.encode(Envelope::invalidate(), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, MessageKind::Heartbeat);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.kind, MessageKind::Invalidate);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = LinkCodec::default();
        let mut full = BytesMut::new();
        codec.encode(Envelope::heartbeat(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_garbage_is_schema_violation() {
        let mut codec = LinkCodec::default();
        let mut buf = BytesMut::new();
        let body = b"{\"seq\": 1, \"type\": 5}";
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = LinkCodec::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_slice(&[b' '; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_oversized_envelope_not_encoded() {
        let mut codec = LinkCodec::new(64);
        let mut buf = BytesMut::new();
        let big = Envelope {
            seq: Some(1),
            kind: MessageKind::Event,
            data: serde_json::json!({ "blob": "x".repeat(128) }),
        };
        assert!(matches!(
            codec.encode(big, &mut buf),
            Err(ProtocolError::FrameTooLarge { limit: 64, .. })
        ));
        assert!(buf.is_empty());
    }
}
