//! Raw passthrough serializer for `Vec<u8>` values.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::codec::{PoolValue, Serializer};
use crate::error::{PoolError, Result};

/// Serializer that writes `Vec<u8>` values verbatim.
///
/// The stream carries exactly one value, so `decode` reads to the end.
pub struct BytesCodec;

impl Serializer for BytesCodec {
    fn encode(&self, value: &PoolValue, writer: &mut dyn Write) -> Result<()> {
        let bytes = value
            .downcast_ref::<Vec<u8>>()
            .ok_or_else(|| PoolError::Codec("value is not a Vec<u8>".to_string()))?;
        writer.write_all(bytes)?;
        Ok(())
    }

    fn decode(&self, reader: &mut dyn Read) -> Result<PoolValue> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Arc::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_bytes() {
        let codec = BytesCodec;
        let value: PoolValue = Arc::new(vec![0u8, 255, 7, 7]);

        let mut buf = Vec::new();
        codec.encode(&value, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8, 255, 7, 7]);

        let back = codec.decode(&mut buf.as_slice()).unwrap();
        assert_eq!(back.downcast_ref::<Vec<u8>>().unwrap(), &buf);
    }
}
