//! tokio-util codec for multiplexed frames

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::mux::{Frame, FrameFlags, FrameType};
use crate::{ProtoError, MAX_FRAME_SIZE};

/// Frames a byte stream into [`Frame`]s and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        // Peek the header without consuming it
        let stream_id = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let frame_type = FrameType::try_from(src[4])?;
        let flags = FrameFlags(src[5]);
        let length = u32::from_be_bytes([src[6], src[7], src[8], src[9]]);

        if length > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(length as usize));
        }

        let total = Frame::HEADER_SIZE + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length as usize).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new();
        let encoded = Frame::message(4, Bytes::from_static(b"payload"))
            .encode()
            .unwrap();

        let mut buf = BytesMut::from(&encoded[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[7..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.stream_id, 4);
        assert_eq!(&frame.payload[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u32(MAX_FRAME_SIZE + 1);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtoError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_framed_stream_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedWrite::new(client, FrameCodec::new());
        let mut reader = FramedRead::new(server, FrameCodec::new());

        writer
            .send(Frame::control(Bytes::from_static(b"{\"type\":\"ping\"}")))
            .await
            .unwrap();
        writer.send(Frame::reset(6)).await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.stream_id, 0);
        assert_eq!(first.frame_type, FrameType::Control);

        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.stream_id, 6);
        assert!(second.flags.has_rst());
    }
}
