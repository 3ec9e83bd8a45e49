//! Codec for encoding/decoding channel messages

use crate::messages::ChannelMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Channel message codec
pub struct ChannelCodec;

impl ChannelCodec {
    /// Maximum message size (4MB); tunnel specs and usage batches are small
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

    /// Encode a message to bytes
    ///
    /// Format: [length: u32 big endian][payload: bincode serialized message]
    pub fn encode(msg: &ChannelMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<ChannelMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);
        let msg: ChannelMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{TunnelIntent, TunnelRecord, TunnelSpec, TunnelType};
    use serde_json::json;

    #[test]
    fn test_decode_incomplete() {
        let msg = ChannelMessage::Pong { timestamp: 67890 };
        let encoded = ChannelCodec::encode(&msg).unwrap();

        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let first = ChannelMessage::RemoveTunnel {
            tunnel_id: "t1".to_string(),
        };
        let second = ChannelMessage::UsageAck { accepted: 3 };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ChannelCodec::encode(&first).unwrap());
        buf.extend_from_slice(&ChannelCodec::encode(&second).unwrap());

        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), Some(first));
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), Some(second));
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_tunnel_result_carries_spec() {
        let spec = TunnelSpec::try_from(json!({"endpoint": "1.2.3.4:51820"})).unwrap();
        let intent = TunnelIntent {
            tunnel_id: "t1".to_string(),
            tunnel_type: TunnelType::Wireguard,
            spec: spec.clone(),
        };
        let mut record = TunnelRecord::new(&intent);
        record.applied_spec = Some(spec);

        let msg = ChannelMessage::TunnelResult {
            record,
            warning: None,
        };
        let mut buf = BytesMut::from(ChannelCodec::encode(&msg).unwrap().as_ref());
        assert_eq!(ChannelCodec::decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&((ChannelCodec::MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            ChannelCodec::decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }
}
