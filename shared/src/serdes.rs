//! Big-endian wire read/write primitives used by the message codecs.
//!
//! Decoding is all-or-nothing: a reader that runs off the end of its buffer
//! reports `UnexpectedEnd` and the caller discards the whole attempt, it never
//! consumes a partial value.

use thiserror::Error;

/// Strings and byte blobs are length-prefixed; anything claiming to be larger
/// than this is treated as a corrupt frame rather than an allocation request.
const MAX_BLOB_LEN: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerdesError {
    /// The buffer ended before the value was fully read
    #[error("unexpected end of input (wanted {wanted} more bytes, had {remaining})")]
    UnexpectedEnd { wanted: usize, remaining: usize },

    /// A length prefix exceeded the sanity ceiling
    #[error("blob length {length} exceeds maximum of {MAX_BLOB_LEN}")]
    BlobTooLarge { length: usize },

    /// A string field did not hold valid UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// An enum tag byte had no corresponding variant
    #[error("unknown tag {tag} for {kind}")]
    UnknownTag { kind: &'static str, tag: u8 },
}

/// Appends big-endian encoded primitives to an owned buffer.
pub struct WireWriter {
    buffer: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buffer.extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads big-endian encoded primitives from a borrowed buffer.
pub struct WireReader<'b> {
    buffer: &'b [u8],
    cursor: usize,
}

impl<'b> WireReader<'b> {
    pub fn new(buffer: &'b [u8]) -> Self {
        Self { buffer, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn take(&mut self, count: usize) -> Result<&'b [u8], SerdesError> {
        if self.remaining() < count {
            return Err(SerdesError::UnexpectedEnd {
                wanted: count,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buffer[self.cursor..self.cursor + count];
        self.cursor += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerdesError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, SerdesError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, SerdesError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, SerdesError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, SerdesError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, SerdesError> {
        let bytes = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(array))
    }

    pub fn read_string(&mut self) -> Result<String, SerdesError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| SerdesError::InvalidUtf8)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, SerdesError> {
        let length = self.read_u32()? as usize;
        if length > MAX_BLOB_LEN {
            return Err(SerdesError::BlobTooLarge { length });
        }
        Ok(self.take(length)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut writer = WireWriter::new();
        writer.write_u8(7);
        writer.write_bool(true);
        writer.write_u16(0xBEEF);
        writer.write_i32(-42);
        writer.write_i64(i64::MIN);
        writer.write_string("hello");
        writer.write_bytes(&[1, 2, 3]);

        let bytes = writer.into_bytes();
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_i64().unwrap(), i64::MIN);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut writer = WireWriter::new();
        writer.write_u32(0xDEADBEEF);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes[..3]);
        assert!(matches!(
            reader.read_u32(),
            Err(SerdesError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn oversized_blob_prefix_is_rejected() {
        let mut writer = WireWriter::new();
        writer.write_u32(u32::MAX);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert!(matches!(
            reader.read_bytes(),
            Err(SerdesError::BlobTooLarge { .. })
        ));
    }
}
