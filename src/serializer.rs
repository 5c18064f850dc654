//! Payload serializers for `ProtoConnection`.
//!
//! A serializer turns a structured value into the bytes placed on the wire
//! and back. Two strategies are provided:
//! - `ProtoSerializer`: protobuf encoding via prost
//! - `JsonSerializer`: JSON encoding via serde

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Result type for serializer operations.
pub type Result<T> = std::result::Result<T, SerializeError>;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to decode payload: {0}")]
    Decode(String),
}

/// Encode/decode strategy for values of type `M`.
pub trait Serializer<M>: Send + Sync {
    fn encode(&self, value: &M) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<M>;
}

/// Protobuf serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoSerializer;

impl<M> Serializer<M> for ProtoSerializer
where
    M: prost::Message + Default,
{
    fn encode(&self, value: &M) -> Result<Bytes> {
        Ok(Bytes::from(value.encode_to_vec()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M> {
        M::decode(bytes).map_err(|e| SerializeError::Decode(e.to_string()))
    }
}

/// JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<M> Serializer<M> for JsonSerializer
where
    M: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &M) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SerializeError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<M> {
        serde_json::from_slice(bytes).map_err(|e| SerializeError::Decode(e.to_string()))
    }
}
