//! Value encoding for the distributed tier

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Converts cached values to and from the bytes stored remotely.
pub trait Codec: Send + Sync + 'static {
    fn encode<V: Serialize>(&self, value: &V) -> Result<Vec<u8>, CacheError>;

    fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V, CacheError>;
}

/// JSON encoding, readable with `redis-cli`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<V: Serialize>(&self, value: &V) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
