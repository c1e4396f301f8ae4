//! Stackable byte-stream filters for the serialization file device.
//!
//! A [`ByteFilter`] is a symmetric pair of stream wrappers: `encode` wraps
//! the writer a value is serialized into, `decode` wraps the reader it is
//! deserialized from. Filters compose: with filters `[a, b]`, bytes flow
//! `serializer -> b -> a -> file` on write and `file -> a -> b ->
//! deserializer` on read, so the on-disk bytes are `a(b(serialized))` and
//! each filter always unwraps exactly what it wrapped.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::error::Result;

/// A symmetric stream transformation (compression, encryption, ...).
pub trait ByteFilter: Send + Sync {
    /// Wrap the writer on the encode path.
    fn encode<'a>(&self, writer: Box<dyn Write + 'a>) -> Result<Box<dyn Write + 'a>>;

    /// Wrap the reader on the decode path.
    fn decode<'a>(&self, reader: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>>;
}

/// Shared handle to a filter.
pub type FilterHandle = Arc<dyn ByteFilter>;

/// Wrap `writer` with every filter in `filters`; `filters[0]` ends up
/// closest to the underlying writer.
pub fn wrap_writer<'a>(
    filters: &[FilterHandle],
    writer: Box<dyn Write + 'a>,
) -> Result<Box<dyn Write + 'a>> {
    let mut writer = writer;
    for filter in filters {
        writer = filter.encode(writer)?;
    }
    Ok(writer)
}

/// Wrap `reader` with every filter in `filters`, mirroring
/// [`wrap_writer`].
pub fn wrap_reader<'a>(
    filters: &[FilterHandle],
    reader: Box<dyn Read + 'a>,
) -> Result<Box<dyn Read + 'a>> {
    let mut reader = reader;
    for filter in filters {
        reader = filter.decode(reader)?;
    }
    Ok(reader)
}

/// Single-byte XOR filter. Self-inverse, dependency-free; useful for
/// exercising filter stacking.
pub struct XorFilter {
    key: u8,
}

impl XorFilter {
    /// Create a filter with the given key byte.
    pub fn new(key: u8) -> Self {
        Self { key }
    }
}

struct XorWriter<'a> {
    inner: Box<dyn Write + 'a>,
    key: u8,
}

impl Write for XorWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let transformed: Vec<u8> = buf.iter().map(|b| b ^ self.key).collect();
        self.inner.write_all(&transformed)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct XorReader<'a> {
    inner: Box<dyn Read + 'a>,
    key: u8,
}

impl Read for XorReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        for b in &mut buf[..n] {
            *b ^= self.key;
        }
        Ok(n)
    }
}

impl ByteFilter for XorFilter {
    fn encode<'a>(&self, writer: Box<dyn Write + 'a>) -> Result<Box<dyn Write + 'a>> {
        Ok(Box::new(XorWriter {
            inner: writer,
            key: self.key,
        }))
    }

    fn decode<'a>(&self, reader: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        Ok(Box::new(XorReader {
            inner: reader,
            key: self.key,
        }))
    }
}

/// Zstd compression filter.
#[cfg(feature = "zstd-filter")]
pub struct ZstdFilter {
    level: i32,
}

#[cfg(feature = "zstd-filter")]
impl ZstdFilter {
    /// Create a filter at the given compression level (0 = zstd default).
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "zstd-filter")]
impl ByteFilter for ZstdFilter {
    fn encode<'a>(&self, writer: Box<dyn Write + 'a>) -> Result<Box<dyn Write + 'a>> {
        let encoder = zstd::stream::write::Encoder::new(writer, self.level)
            .map_err(crate::error::PoolError::Io)?;
        Ok(Box::new(encoder.auto_finish()))
    }

    fn decode<'a>(&self, reader: Box<dyn Read + 'a>) -> Result<Box<dyn Read + 'a>> {
        let decoder =
            zstd::stream::read::Decoder::new(reader).map_err(crate::error::PoolError::Io)?;
        Ok(Box::new(decoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(filters: &[FilterHandle], payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut encoded = Vec::new();
        {
            let mut writer = wrap_writer(filters, Box::new(&mut encoded)).unwrap();
            writer.write_all(payload).unwrap();
            writer.flush().unwrap();
        }
        let mut decoded = Vec::new();
        {
            let mut reader = wrap_reader(filters, Box::new(encoded.as_slice())).unwrap();
            reader.read_to_end(&mut decoded).unwrap();
        }
        (encoded, decoded)
    }

    #[test]
    fn test_xor_is_symmetric() {
        let filters: Vec<FilterHandle> = vec![Arc::new(XorFilter::new(0x5a))];
        let payload = b"swap me out".to_vec();
        let (encoded, decoded) = roundtrip(&filters, &payload);

        assert_ne!(encoded, payload);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_stacked_filters_wrap_symmetrically() {
        // filters[0] is closest to the underlying stream, so the raw
        // bytes are xor_a(xor_b(payload)).
        let filters: Vec<FilterHandle> =
            vec![Arc::new(XorFilter::new(0x0f)), Arc::new(XorFilter::new(0xf0))];
        let payload = vec![1u8, 2, 3, 4, 5];
        let (encoded, decoded) = roundtrip(&filters, &payload);

        let expected: Vec<u8> = payload.iter().map(|b| b ^ 0x0f ^ 0xf0).collect();
        assert_eq!(encoded, expected);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let (encoded, decoded) = roundtrip(&[], b"plain".as_slice());
        assert_eq!(encoded, b"plain");
        assert_eq!(decoded, b"plain");
    }

    #[cfg(feature = "zstd-filter")]
    #[test]
    fn test_zstd_roundtrip() {
        let filters: Vec<FilterHandle> = vec![Arc::new(ZstdFilter::new(0))];
        let payload = vec![42u8; 4096];
        let (encoded, decoded) = roundtrip(&filters, &payload);

        assert!(encoded.len() < payload.len());
        assert_eq!(decoded, payload);
    }
}
