//! Frame codec: 16-byte header + typed payload, implemented as a
//! `tokio_util::codec::{Decoder, Encoder}` pair over a `BytesMut`.
//!
//! The decoder is a two-state machine (`Header`, `Body`) that is replay-safe:
//! `decode` may be re-entered after a partial read without re-parsing bytes
//! already consumed, since the header is only parsed once per frame and the
//! state carries forward across calls.

use crate::error::CodecError;
use crate::model::{Acknowledge, Message, Sign};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC: u16 = 0xBABE;
pub const HEADER_LEN: usize = 16;

/// Body (de)serialization, kept behind a trait so the wire's 16-byte header
/// framing stays independent of the payload encoding. This crate ships one
/// implementation (`BincodeSerializer`); a deployment wanting JSON or protobuf
/// bodies on the same frame header would implement this trait rather than
/// touch `RegistryCodec`.
pub trait BodySerializer: std::fmt::Debug + Send + Sync {
    fn serialize_message(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;
    fn deserialize_message(&self, bytes: &[u8]) -> Result<Message, CodecError>;
    fn serialize_ack(&self, ack: &Acknowledge) -> Result<Vec<u8>, CodecError>;
    fn deserialize_ack(&self, bytes: &[u8]) -> Result<Acknowledge, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl BodySerializer for BincodeSerializer {
    fn serialize_message(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(msg)?)
    }

    fn deserialize_message(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn serialize_ack(&self, ack: &Acknowledge) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(ack)?)
    }

    fn deserialize_ack(&self, bytes: &[u8]) -> Result<Acknowledge, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// Heartbeat frames carry no payload; the codec logs and swallows them.
    Heartbeat,
    Message(Message),
    Ack(Acknowledge),
}

/// An outbound frame ready for encoding. `id` is always `0` for server
/// pushes per the wire format note in SPEC_FULL.md §9 — correlation relies
/// on the body-encoded `sequence`, not the header `id`.
#[derive(Debug)]
pub struct OutboundFrame {
    pub sign: Sign,
    pub id: u64,
    pub body: Bytes,
}

impl OutboundFrame {
    pub fn for_message(msg: &Message) -> Result<Self, CodecError> {
        Self::for_message_with(msg, &BincodeSerializer)
    }

    pub fn for_ack(ack: &Acknowledge) -> Result<Self, CodecError> {
        Self::for_ack_with(ack, &BincodeSerializer)
    }

    pub fn for_message_with(msg: &Message, serializer: &dyn BodySerializer) -> Result<Self, CodecError> {
        let body = serializer.serialize_message(msg)?;
        Ok(Self { sign: msg.sign, id: 0, body: Bytes::from(body) })
    }

    pub fn for_ack_with(ack: &Acknowledge, serializer: &dyn BodySerializer) -> Result<Self, CodecError> {
        let body = serializer.serialize_ack(ack)?;
        Ok(Self { sign: Sign::Ack, id: 0, body: Bytes::from(body) })
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Body { sign: Sign, body_len: usize },
}

/// Frame codec for one connection. Holds the header/body state machine and
/// the body serializer (bincode by default; see `BodySerializer`).
#[derive(Debug)]
pub struct RegistryCodec {
    state: DecodeState,
    serializer: Arc<dyn BodySerializer>,
}

impl RegistryCodec {
    pub fn new() -> Self {
        Self::with_serializer(Arc::new(BincodeSerializer))
    }

    pub fn with_serializer(serializer: Arc<dyn BodySerializer>) -> Self {
        Self { state: DecodeState::Header, serializer }
    }
}

impl Default for RegistryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RegistryCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_LEN {
                        src.reserve(HEADER_LEN - src.len());
                        return Ok(None);
                    }
                    let magic = u16::from_be_bytes([src[0], src[1]]);
                    if magic != MAGIC {
                        return Err(CodecError::IllegalMagic);
                    }
                    let sign_byte = src[2];
                    // src[3] is the reserved byte, always 0x00.
                    let body_len = i32::from_be_bytes([src[12], src[13], src[14], src[15]]) as usize;
                    let sign = Sign::try_from(sign_byte).map_err(CodecError::IllegalSign)?;
                    src.advance(HEADER_LEN);
                    self.state = DecodeState::Body { sign, body_len };
                }
                DecodeState::Body { sign, body_len } => {
                    if src.len() < body_len {
                        src.reserve(body_len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(body_len);
                    self.state = DecodeState::Header;

                    match sign {
                        Sign::Heartbeat => {
                            tracing::trace!("heartbeat frame received");
                            continue;
                        }
                        Sign::Ack => {
                            let ack = self.serializer.deserialize_ack(&body)?;
                            return Ok(Some(Frame::Ack(ack)));
                        }
                        other => {
                            let mut msg = self.serializer.deserialize_message(&body)?;
                            msg.sign = other;
                            return Ok(Some(Frame::Message(msg)));
                        }
                    }
                }
            }
        }
    }
}

impl Encoder<OutboundFrame> for RegistryCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_LEN + frame.body.len());
        dst.put_u16(MAGIC);
        dst.put_u8(frame.sign as u8);
        dst.put_u8(0); // reserved
        dst.put_u64(frame.id);
        dst.put_i32(frame.body.len() as i32);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Address, RegisterMeta, ServiceMeta};

    fn sample_message() -> Message {
        let service = ServiceMeta::new("group", "svc", "1.0.0");
        let meta = RegisterMeta::new(service.clone(), Address::new("10.0.0.1", 9000));
        Message::publish(7, meta)
    }

    fn roundtrip(frame: OutboundFrame) -> Frame {
        let mut codec = RegistryCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().expect("one frame")
    }

    #[test]
    fn round_trips_a_publish_message() {
        let msg = sample_message();
        let frame = OutboundFrame::for_message(&msg).unwrap();
        match roundtrip(frame) {
            Frame::Message(decoded) => {
                assert_eq!(decoded.sequence, msg.sequence);
                assert_eq!(decoded.sign, msg.sign);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn round_trips_an_ack() {
        let ack = Acknowledge { sequence: 42 };
        let frame = OutboundFrame::for_ack(&ack).unwrap();
        match roundtrip(frame) {
            Frame::Ack(decoded) => assert_eq!(decoded.sequence, 42),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn encoded_size_matches_header_plus_body() {
        let msg = sample_message();
        let frame = OutboundFrame::for_message(&msg).unwrap();
        let body_len = frame.body.len();
        let mut codec = RegistryCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + body_len);
    }

    #[test]
    fn illegal_magic_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xDEAD);
        buf.put_u8(Sign::Heartbeat as u8);
        buf.put_u8(0);
        buf.put_u64(0);
        buf.put_i32(0);
        let mut codec = RegistryCodec::new();
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::IllegalMagic)));
    }

    #[test]
    fn illegal_sign_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(MAGIC);
        buf.put_u8(0xFF);
        buf.put_u8(0);
        buf.put_u64(0);
        buf.put_i32(0);
        let mut codec = RegistryCodec::new();
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::IllegalSign(0xFF))));
    }

    #[test]
    fn partial_frame_is_retried_without_losing_state() {
        let msg = sample_message();
        let frame = OutboundFrame::for_message(&msg).unwrap();
        let mut whole = BytesMut::new();
        RegistryCodec::new().encode(frame, &mut whole).unwrap();

        // Split at every byte boundary and verify the same result comes out.
        for split_at in 0..whole.len() {
            let mut codec = RegistryCodec::new();
            let mut buf = BytesMut::from(&whole[..split_at]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(&whole[split_at..]);
            let decoded = codec.decode(&mut buf).unwrap().expect("full frame available");
            match decoded {
                Frame::Message(decoded) => assert_eq!(decoded.sequence, msg.sequence),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[derive(Debug, Default)]
    struct AlternateSerializer;

    impl BodySerializer for AlternateSerializer {
        fn serialize_message(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
            Ok(bincode::serialize(msg)?)
        }
        fn deserialize_message(&self, bytes: &[u8]) -> Result<Message, CodecError> {
            Ok(bincode::deserialize(bytes)?)
        }
        fn serialize_ack(&self, ack: &Acknowledge) -> Result<Vec<u8>, CodecError> {
            Ok(bincode::serialize(ack)?)
        }
        fn deserialize_ack(&self, bytes: &[u8]) -> Result<Acknowledge, CodecError> {
            Ok(bincode::deserialize(bytes)?)
        }
    }

    #[test]
    fn a_substitute_body_serializer_round_trips_through_the_same_header() {
        let msg = sample_message();
        let frame = OutboundFrame::for_message_with(&msg, &AlternateSerializer).unwrap();
        let mut codec = RegistryCodec::with_serializer(Arc::new(AlternateSerializer));
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        match codec.decode(&mut buf).unwrap().expect("one frame") {
            Frame::Message(decoded) => assert_eq!(decoded.sequence, msg.sequence),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_is_swallowed_and_next_frame_still_decodes() {
        let mut buf = BytesMut::new();
        let mut codec = RegistryCodec::new();
        codec
            .encode(OutboundFrame { sign: Sign::Heartbeat, id: 0, body: Bytes::new() }, &mut buf)
            .unwrap();
        let msg = sample_message();
        codec.encode(OutboundFrame::for_message(&msg).unwrap(), &mut buf).unwrap();

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Message(decoded)) => assert_eq!(decoded.sequence, msg.sequence),
            other => panic!("expected the heartbeat to be swallowed, got {other:?}"),
        }
    }
}
