//! Wire framing shared by unary calls and transfer channels.
//!
//! Every frame is `[kind: u8][len: u32 LE][payload]`. Unlike a bare
//! length prefix, a zero-length payload is a legitimate item (the
//! ready signal), so end of stream is carried by the kind byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::RpcError;

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 5;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const KIND_OPEN_CHANNEL: u8 = 0x03;
const KIND_NEXT: u8 = 0x04;
const KIND_NEXT_COMPLETE: u8 = 0x05;
const KIND_COMPLETE: u8 = 0x06;
const KIND_ERROR: u8 = 0x07;
const KIND_REQUEST_N: u8 = 0x08;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Bincode `RpcRequest` for a single request/response exchange.
    Request(Bytes),
    /// Bincode `RpcResponse` answering a `Request`.
    Response(Bytes),
    /// Bincode `RpcRequest` whose params carry the channel metadata.
    OpenChannel(Bytes),
    /// One channel item. `complete` marks it as the last item in this direction.
    Next { payload: Bytes, complete: bool },
    /// Normal end of this direction with no further items.
    Complete,
    /// Terminal failure carrying an encoded `ErrorPayload`.
    Error(Bytes),
    /// Grants the peer permission to send this many more items.
    RequestN(u32),
}

impl Frame {
    /// Whether this frame ends the sending direction it travels on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::Next { complete: true, .. } | Frame::Complete | Frame::Error(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Request(_) => "REQUEST",
            Frame::Response(_) => "RESPONSE",
            Frame::OpenChannel(_) => "OPEN_CHANNEL",
            Frame::Next { complete: false, .. } => "NEXT",
            Frame::Next { complete: true, .. } => "NEXT_COMPLETE",
            Frame::Complete => "COMPLETE",
            Frame::Error(_) => "ERROR",
            Frame::RequestN(_) => "REQUEST_N",
        }
    }

    pub fn to_bytes(self) -> Result<Bytes, RpcError> {
        let mut buffer = BytesMut::new();
        FrameCodec.encode(self, &mut buffer)?;
        Ok(buffer.freeze())
    }

    fn into_parts(self) -> (u8, Bytes) {
        match self {
            Frame::Request(body) => (KIND_REQUEST, body),
            Frame::Response(body) => (KIND_RESPONSE, body),
            Frame::OpenChannel(body) => (KIND_OPEN_CHANNEL, body),
            Frame::Next {
                payload,
                complete: false,
            } => (KIND_NEXT, payload),
            Frame::Next {
                payload,
                complete: true,
            } => (KIND_NEXT_COMPLETE, payload),
            Frame::Complete => (KIND_COMPLETE, Bytes::new()),
            Frame::Error(payload) => (KIND_ERROR, payload),
            Frame::RequestN(n) => (KIND_REQUEST_N, Bytes::copy_from_slice(&n.to_le_bytes())),
        }
    }

    fn from_parts(kind: u8, payload: Bytes) -> Result<Self, RpcError> {
        let frame = match kind {
            KIND_REQUEST => Frame::Request(payload),
            KIND_RESPONSE => Frame::Response(payload),
            KIND_OPEN_CHANNEL => Frame::OpenChannel(payload),
            KIND_NEXT => Frame::Next {
                payload,
                complete: false,
            },
            KIND_NEXT_COMPLETE => Frame::Next {
                payload,
                complete: true,
            },
            KIND_COMPLETE => Frame::Complete,
            KIND_ERROR => Frame::Error(payload),
            KIND_REQUEST_N => {
                let raw: [u8; 4] = payload.as_ref().try_into().map_err(|_| {
                    RpcError::ProtocolError(format!(
                        "REQUEST_N carries {} bytes, expected 4",
                        payload.len()
                    ))
                })?;
                Frame::RequestN(u32::from_le_bytes(raw))
            }
            other => {
                return Err(RpcError::ProtocolError(format!(
                    "unknown frame kind 0x{other:02x}"
                )))
            }
        };
        Ok(frame)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Frame::from_parts(kind, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RpcError> {
        let (kind, payload) = frame.into_parts();
        if payload.len() > MAX_FRAME_LEN {
            return Err(RpcError::ProtocolError(format!(
                "refusing to send a {} byte frame",
                payload.len()
            )));
        }
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let encoded = Frame::Next {
            payload: Bytes::from_static(b"hello"),
            complete: false,
        }
        .to_bytes()
        .unwrap();

        let mut codec = FrameCodec;
        let mut buffer = BytesMut::from(&encoded[..3]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&encoded[3..7]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&encoded[7..]);
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Next {
                payload: Bytes::from_static(b"hello"),
                complete: false
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_item_is_distinct_from_complete() {
        let mut buffer = BytesMut::new();
        let mut codec = FrameCodec;
        codec
            .encode(
                Frame::Next {
                    payload: Bytes::new(),
                    complete: false,
                },
                &mut buffer,
            )
            .unwrap();
        codec.encode(Frame::Complete, &mut buffer).unwrap();

        let first = codec.decode(&mut buffer).unwrap().unwrap();
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(
            first,
            Frame::Next {
                payload: Bytes::new(),
                complete: false
            }
        );
        assert!(!first.is_terminal());
        assert_eq!(second, Frame::Complete);
        assert!(second.is_terminal());
    }

    #[test]
    fn request_n_payload_must_be_four_bytes() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(KIND_REQUEST_N);
        buffer.put_u32_le(2);
        buffer.put_u16_le(7);

        let err = FrameCodec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, RpcError::ProtocolError(_)));
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(KIND_NEXT);
        buffer.put_u32_le((MAX_FRAME_LEN + 1) as u32);

        let err = FrameCodec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, RpcError::ProtocolError(_)));
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(0x7f);
        buffer.put_u32_le(0);

        let err = FrameCodec.decode(&mut buffer).unwrap_err();
        assert!(err.to_string().contains("0x7f"));
    }
}
