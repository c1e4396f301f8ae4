//! The serialization seam between the engine and user values.
//!
//! The engine treats values as opaque handles ([`PoolValue`]) and only ever
//! turns them into bytes through a [`Serializer`], supplied when a
//! serialization device is constructed. Two built-in serializers cover the
//! common cases: [`BincodeCodec`] for serde types and [`BytesCodec`] for raw
//! byte buffers.

mod bincode;
mod bytes;

pub use self::bincode::BincodeCodec;
pub use self::bytes::BytesCodec;

use std::any::Any;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::Result;

/// Opaque handle to a stored value. May be anything the configured
/// serializer can encode.
pub type PoolValue = Arc<dyn Any + Send + Sync>;

/// Encodes values to byte streams and back.
///
/// Implementations must be symmetric: `decode(encode(v))` yields a value
/// equal to `v` for every value they accept.
pub trait Serializer: Send + Sync {
    /// Write `value` to `writer`.
    fn encode(&self, value: &PoolValue, writer: &mut dyn Write) -> Result<()>;

    /// Read one value from `reader`.
    fn decode(&self, reader: &mut dyn Read) -> Result<PoolValue>;
}

/// Shared handle to a serializer.
pub type SerializerHandle = Arc<dyn Serializer>;
