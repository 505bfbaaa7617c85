//! Pluggable serialization of frame payloads.
//!
//! Every frame on a node connection carries one encoded [`SyncMessage`].
//! The [`MessageCodec`] trait decides how that message becomes bytes;
//! [`JsonCodec`] is the default and is convenient when reading captures.
//!
//! # Example
//!
//! ```rust
//! use syncrpc::{JsonCodec, MessageCodec, MessageType, SyncMessage};
//!
//! let codec = JsonCodec;
//! let msg = SyncMessage::new(MessageType::EchoRequest, 7, vec![1, 2, 3]);
//!
//! let bytes = codec.encode(&msg).expect("encode");
//! let decoded: SyncMessage = codec.decode(&bytes).expect("decode");
//! assert_eq!(msg, decoded);
//! ```
//!
//! [`SyncMessage`]: crate::SyncMessage

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A message could not be turned into bytes or back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serializing the message failed.
    #[error("encode error: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// The bytes do not describe a valid message.
    #[error("decode error: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Serialization format for frame payloads.
///
/// Codecs are cloned into every connection task, so they should be cheap
/// to clone and shareable across threads. Both ends of a connection must
/// use the same codec.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Serialize `msg`.
    ///
    /// # Errors
    ///
    /// [`CodecError::Encode`] when the format cannot represent the value.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a value from `buf`.
    ///
    /// # Errors
    ///
    /// [`CodecError::Decode`] when `buf` is not a valid encoding of `T`.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// serde_json codec, the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HelloMessage, MessageType, NodeId, SyncMessage};

    #[test]
    fn test_hello_payload_is_compact() {
        let bytes = JsonCodec
            .encode(&HelloMessage { node_id: NodeId(4) })
            .expect("encode");
        assert_eq!(&bytes, br#"{"node_id":4}"#);
    }

    #[test]
    fn test_missing_payload_defaults_to_empty() {
        let decoded: SyncMessage = JsonCodec
            .decode(br#"{"message_type":"sync_offer","transaction_id":9}"#)
            .expect("decode");
        assert_eq!(decoded.message_type, MessageType::SyncOffer);
        assert_eq!(decoded.transaction_id, 9);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<SyncMessage, _> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }
}
