//! Serialization collaborator boundary.
//!
//! Every payload crossing the broker boundary goes through a [`Codec`]. A
//! deserialize failure is reported as [`SubscriptionError::Deserialization`],
//! which the engines route to a dead-letter destination instead of failing
//! the subscription.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SubscriptionError};

pub trait Codec<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>>;

    /// `topic` is carried for error reporting only.
    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<T>;
}

/// JSON codec over serde, the wire format used throughout.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| SubscriptionError::Fatal(format!("failed to serialize payload: {e}")))
    }

    fn deserialize(&self, topic: &str, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| SubscriptionError::Deserialization {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}
