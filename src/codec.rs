//! Payload conventions layered on channel items.
//!
//! Raw chunks travel as-is. A zero-length item is the ready handshake and
//! the literal `COMPLETE` on a terminal item marks the end of a download.
//! Control dictionaries (begin acknowledgement, error details, transfer
//! requests) are MessagePack maps.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::TransferError;

/// Payload of the final item of a download.
pub const SENTINEL: &[u8] = b"COMPLETE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEnvelope {
    /// Empty handshake token.
    Ready,
    Data(Bytes),
    /// End marker carried on the terminal item instead of data.
    Sentinel,
}

impl ChunkEnvelope {
    pub fn classify(payload: Bytes, complete: bool) -> Self {
        if complete && (payload.is_empty() || payload.as_ref() == SENTINEL) {
            ChunkEnvelope::Sentinel
        } else if payload.is_empty() {
            ChunkEnvelope::Ready
        } else {
            ChunkEnvelope::Data(payload)
        }
    }
}

pub fn ready() -> Bytes {
    Bytes::new()
}

pub fn sentinel() -> Bytes {
    Bytes::from_static(SENTINEL)
}

pub fn encode_control<T: Serialize>(value: &T) -> Result<Bytes, TransferError> {
    rmp_serde::to_vec_named(value)
        .map(Bytes::from)
        .map_err(|err| TransferError::Protocol(format!("cannot encode control message: {err}")))
}

pub fn decode_control<T: DeserializeOwned>(payload: &[u8]) -> Result<T, TransferError> {
    rmp_serde::from_slice(payload)
        .map_err(|err| TransferError::Protocol(format!("malformed control message: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Control;

    #[test]
    fn classify_distinguishes_handshake_data_and_end() {
        assert_eq!(ChunkEnvelope::classify(Bytes::new(), false), ChunkEnvelope::Ready);
        assert_eq!(ChunkEnvelope::classify(sentinel(), true), ChunkEnvelope::Sentinel);
        assert_eq!(ChunkEnvelope::classify(Bytes::new(), true), ChunkEnvelope::Sentinel);
        assert_eq!(
            ChunkEnvelope::classify(Bytes::from_static(b"abc"), true),
            ChunkEnvelope::Data(Bytes::from_static(b"abc"))
        );
    }

    #[test]
    fn sentinel_bytes_without_terminal_flag_are_plain_data() {
        assert_eq!(
            ChunkEnvelope::classify(sentinel(), false),
            ChunkEnvelope::Data(sentinel())
        );
    }

    #[test]
    fn begin_control_is_a_message_map() {
        let encoded = encode_control(&Control::Begin).unwrap();
        let value: std::collections::BTreeMap<String, String> =
            rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(value.get("message").map(String::as_str), Some("BEGIN"));
        assert_eq!(decode_control::<Control>(&encoded).unwrap(), Control::Begin);
    }

    #[test]
    fn garbage_control_is_a_protocol_error() {
        let err = decode_control::<Control>(b"\xc1\xc1").unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }
}
