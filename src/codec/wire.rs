//! Length-prefixed binary wire primitives
//!
//! Layout rules shared by every entity and message:
//! - variable-length fields: `u32` big-endian byte count, then the raw bytes
//! - integers: fixed-width big-endian
//! - booleans: one byte, `0` or `1`
//! - message tags: 16 ASCII bytes, right-padded with spaces

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of a message tag on the wire
pub const TAG_LEN: usize = 16;

/// Upper bound on a single length-prefixed field
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Maximum nesting of length-prefixed entities (a transaction inside a
/// block inside a frame, inputs inside a transaction, ...)
pub const MAX_NESTING_DEPTH: usize = 8;

/// Wire decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Unknown message type: {0:?}")]
    UnknownMessageType(String),
}

impl CodecError {
    fn truncated(what: &str, need: usize, have: usize) -> Self {
        CodecError::MalformedMessage(format!(
            "truncated {}: need {} bytes, have {}",
            what, need, have
        ))
    }
}

/// Types with a wire encoding
pub trait Encode {
    fn encode(&self, writer: &mut WireWriter);

    /// Encode into a standalone buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.encode(&mut writer);
        writer.into_vec()
    }
}

/// Types that can be decoded from their wire encoding
pub trait Decode: Sized {
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, CodecError>;

    /// Decode a whole buffer; trailing bytes are an error
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = WireReader::new(bytes);
        let value = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

/// Append-only encoder
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_tag(&mut self, tag: &[u8; TAG_LEN]) {
        self.buf.put_slice(tag);
    }

    /// Length-prefixed raw bytes
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Length-prefixed nested entity
    pub fn put_encoded<T: Encode + ?Sized>(&mut self, value: &T) {
        let mut inner = WireWriter::new();
        value.encode(&mut inner);
        self.put_bytes(&inner.buf);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Cursor-based decoder over a borrowed buffer
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    depth: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, depth: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, what: &str, len: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < len {
            return Err(CodecError::truncated(what, len, self.buf.remaining()));
        }
        Ok(())
    }

    pub fn get_tag(&mut self) -> Result<[u8; TAG_LEN], CodecError> {
        self.need("tag", TAG_LEN)?;
        let mut tag = [0u8; TAG_LEN];
        self.buf.copy_to_slice(&mut tag);
        Ok(tag)
    }

    fn get_slice(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(CodecError::MalformedMessage(format!(
                "field length {} exceeds limit {}",
                len, MAX_FIELD_LEN
            )));
        }
        self.need("field", len)?;
        let buf: &'a [u8] = self.buf;
        let (field, rest) = buf.split_at(len);
        self.buf = rest;
        Ok(field)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        self.get_slice().map(<[u8]>::to_vec)
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| CodecError::MalformedMessage("string is not valid UTF-8".to_string()))
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        self.need("u16", 2)?;
        Ok(self.buf.get_u16())
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.need("u32", 4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.need("u64", 8)?;
        Ok(self.buf.get_u64())
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        self.need("bool", 1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::MalformedMessage(format!(
                "invalid boolean byte {}",
                other
            ))),
        }
    }

    /// Decode a length-prefixed nested entity, consuming exactly its field
    pub fn get_decoded<T: Decode>(&mut self) -> Result<T, CodecError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(CodecError::MalformedMessage(
                "entity nesting too deep".to_string(),
            ));
        }
        let field = self.get_slice()?;
        let mut inner = WireReader {
            buf: field,
            depth: self.depth + 1,
        };
        let value = T::decode(&mut inner)?;
        inner.finish()?;
        Ok(value)
    }

    /// Ensure the buffer was consumed completely
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::MalformedMessage(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
