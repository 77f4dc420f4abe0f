//! Byte-level field codec for the branch protocol.
//!
//! Integers are big-endian fixed width, strings are NUL-terminated, UUIDs
//! are their raw 16 bytes. Durations travel as signed nanosecond counts with
//! `i64::MAX`/`i64::MIN` denoting the infinities. The message size field is
//! a big-endian base-128 varint of one to five bytes whose MSB marks
//! continuation.

use uuid::Uuid;
use yogi_primitives::{Duration, Timestamp};

use crate::errors::{Error, ErrorKind, Result};

/// Longest possible encoded message size field.
pub const MAX_SIZE_FIELD_LENGTH: usize = 5;

/// Number of bytes [`serialize_msg_size_field`] will produce for `msg_size`.
pub fn msg_size_field_length(msg_size: usize) -> usize {
    1 + usize::from(msg_size >= 1 << 7)
        + usize::from(msg_size >= 1 << 14)
        + usize::from(msg_size >= 1 << 21)
        + usize::from(msg_size >= 1 << 28)
}

/// Encodes `msg_size` into `buffer`; returns the number of bytes used.
pub fn serialize_msg_size_field(msg_size: usize, buffer: &mut [u8; MAX_SIZE_FIELD_LENGTH]) -> usize {
    let length = msg_size_field_length(msg_size);

    for (idx, slot) in buffer.iter_mut().take(length).enumerate() {
        let shift = (length - idx - 1) * 7;
        let mut byte = ((msg_size >> shift) & 0x7F) as u8;
        if idx + 1 < length {
            byte |= 1 << 7;
        }
        *slot = byte;
    }

    length
}

/// Decodes the size field from the first `size` bytes of `buffer`.
///
/// Returns `None` while the field is still incomplete.
pub fn deserialize_msg_size_field(
    buffer: &[u8; MAX_SIZE_FIELD_LENGTH],
    size: usize,
) -> Option<usize> {
    let mut tmp = 0usize;

    for &byte in buffer.iter().take(size) {
        tmp |= usize::from(byte & 0x7F);
        if byte & (1 << 7) == 0 {
            return Some(tmp);
        }
        tmp <<= 7;
    }

    None
}

/// Append-only field writer.
pub trait SerializeField {
    fn serialize_to(&self, buffer: &mut Vec<u8>);
}

impl SerializeField for bool {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.push(u8::from(*self));
    }
}

impl SerializeField for u16 {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_be_bytes());
    }
}

impl SerializeField for i32 {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_be_bytes());
    }
}

// Sizes travel as 32-bit values on the wire.
impl SerializeField for usize {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&(*self as u32).to_be_bytes());
    }
}

impl SerializeField for i64 {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_be_bytes());
    }
}

impl SerializeField for Duration {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        let ns = match self.as_nanos() {
            Some(ns) => ns,
            None if self.is_neg() => i64::MIN,
            None => i64::MAX,
        };
        ns.serialize_to(buffer);
    }
}

impl SerializeField for Timestamp {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        self.ns_since_epoch().serialize_to(buffer);
    }
}

impl SerializeField for str {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self.as_bytes());
        buffer.push(0);
    }
}

impl SerializeField for String {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        self.as_str().serialize_to(buffer);
    }
}

impl SerializeField for Uuid {
    fn serialize_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self.as_bytes());
    }
}

/// Reader over a serialized field sequence.
pub struct FieldReader<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buffer: &'a [u8]) -> FieldReader<'a> {
        FieldReader { buffer, pos: 0 }
    }

    pub fn at(buffer: &'a [u8], pos: usize) -> FieldReader<'a> {
        FieldReader { buffer, pos }
    }

    fn error() -> Error {
        Error::new(ErrorKind::DeserializeMsgFailed)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(Self::error)?;
        let slice = self.buffer.get(self.pos..end).ok_or_else(Self::error)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }

    pub fn read_duration(&mut self) -> Result<Duration> {
        let ns = self.read_i64()?;
        Ok(match ns {
            i64::MAX => Duration::inf(),
            i64::MIN => Duration::neg_inf(),
            ns => Duration::from_nanos(ns),
        })
    }

    pub fn read_timestamp(&mut self) -> Result<Timestamp> {
        Ok(Timestamp::from_ns_since_epoch(self.read_i64()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let rest = self.buffer.get(self.pos..).ok_or_else(Self::error)?;
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(Self::error)?;

        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| Self::error())?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(arr))
    }
}
