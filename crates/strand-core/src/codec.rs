//! Value codecs
//!
//! Logs and indexes are generic over their value type. The byte encoding is
//! supplied at construction time as a [`Codec`] strategy instead of being
//! discovered at runtime.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LogError;
use crate::seq::{Seq, decode_seq, encode_seq};

/// Encodes and decodes values of one type
pub trait Codec<T>: Send + Sync + 'static {
    /// Encode a value to bytes
    fn encode(&self, value: &T) -> Result<Vec<u8>, LogError>;

    /// Decode a value from bytes
    fn decode(&self, bytes: &[u8]) -> Result<T, LogError>;
}

/// Compact binary encoding via postcard
pub struct PostcardCodec<T>(PhantomData<fn() -> T>);

impl<T> PostcardCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for PostcardCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PostcardCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PostcardCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostcardCodec")
    }
}

impl<T> Codec<T> for PostcardCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, LogError> {
        postcard::to_allocvec(value).map_err(|e| LogError::codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, LogError> {
        postcard::from_bytes(bytes).map_err(|e| LogError::codec(e.to_string()))
    }
}

/// Human-readable JSON encoding, the default for inspected stores
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, LogError> {
        serde_json::to_vec(value).map_err(|e| LogError::codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, LogError> {
        serde_json::from_slice(bytes).map_err(|e| LogError::codec(e.to_string()))
    }
}

/// Identity encoding for raw byte values
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, LogError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, LogError> {
        Ok(bytes.to_vec())
    }
}

/// Fixed-width big-endian encoding for seq values (pointer logs)
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqCodec;

impl Codec<Seq> for SeqCodec {
    fn encode(&self, value: &Seq) -> Result<Vec<u8>, LogError> {
        Ok(encode_seq(*value).to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Seq, LogError> {
        decode_seq(bytes)
            .ok_or_else(|| LogError::codec(format!("expected 8 bytes for seq, got {}", bytes.len())))
    }
}
