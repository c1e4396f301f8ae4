//! Serde+bincode serializer for typed values.

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{PoolValue, Serializer};
use crate::error::{PoolError, Result};

/// Serializer for values of a single serde-compatible type `T`.
///
/// `encode` rejects handles that do not contain a `T`; `decode` always
/// produces a `T` handle.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Create the codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &PoolValue, writer: &mut dyn Write) -> Result<()> {
        let typed = value
            .downcast_ref::<T>()
            .ok_or_else(|| PoolError::Codec(format!("value is not a {}", std::any::type_name::<T>())))?;
        bincode::serialize_into(writer, typed)
            .map_err(|e| PoolError::Codec(format!("bincode encode: {e}")))
    }

    fn decode(&self, reader: &mut dyn Read) -> Result<PoolValue> {
        let typed: T = bincode::deserialize_from(reader)
            .map_err(|e| PoolError::Codec(format!("bincode decode: {e}")))?;
        Ok(Arc::new(typed))
    }
}
