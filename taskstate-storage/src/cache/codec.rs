//! Key and value encoding for named caches.
//!
//! Keys are always encoded with serde_json. Values are encoded according to
//! the [`ValueSerialization`] chosen when the cache is declared: derived from
//! the value type's serde implementations, or an explicit [`ValueCodec`].

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Failure encoding or decoding one value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError(e.to_string())
    }
}

/// Bounds required of cache keys.
pub trait CacheKey: Serialize + Eq + Hash + Clone + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Serialize + Eq + Hash + Clone + Send + Sync + 'static {}

/// Bounds required of cache values.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Converts values to and from their stored byte form.
pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<V, CodecError>;
}

/// serde_json codec derived from the value type.
pub struct JsonCodec<V> {
    _value: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    pub fn new() -> Self {
        Self { _value: PhantomData }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ValueCodec<V> for JsonCodec<V>
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// How the values of a named cache are serialized.
///
/// Both forms resolve to a codec; they differ in where it comes from.
pub enum ValueSerialization<V> {
    /// Codec derived from the value type's serde implementations.
    ByType(Arc<dyn ValueCodec<V>>),
    /// Caller-supplied codec.
    ByCodec(Arc<dyn ValueCodec<V>>),
}

impl<V> ValueSerialization<V> {
    pub fn by_type() -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        ValueSerialization::ByType(Arc::new(JsonCodec::<V>::new()))
    }

    pub fn by_codec(codec: impl ValueCodec<V> + 'static) -> Self {
        ValueSerialization::ByCodec(Arc::new(codec))
    }

    pub fn codec(&self) -> &Arc<dyn ValueCodec<V>> {
        match self {
            ValueSerialization::ByType(codec) | ValueSerialization::ByCodec(codec) => codec,
        }
    }

    pub fn is_by_type(&self) -> bool {
        matches!(self, ValueSerialization::ByType(_))
    }
}

impl<V> Clone for ValueSerialization<V> {
    fn clone(&self) -> Self {
        match self {
            ValueSerialization::ByType(codec) => ValueSerialization::ByType(codec.clone()),
            ValueSerialization::ByCodec(codec) => ValueSerialization::ByCodec(codec.clone()),
        }
    }
}

impl<V> fmt::Debug for ValueSerialization<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSerialization::ByType(_) => write!(f, "ByType"),
            ValueSerialization::ByCodec(_) => write!(f, "ByCodec"),
        }
    }
}

pub(crate) fn encode_key<K: Serialize>(key: &K) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(key)?)
}
