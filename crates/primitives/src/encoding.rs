//! Consensus-style serialization.
//!
//! Little-endian integers, Bitcoin-style compact sizes for lengths, and
//! strict decoding: every reader fails on truncation and callers are
//! expected to reject trailing bytes.

use std::fmt;

use zocd_consensus::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DecodeError {
    UnexpectedEnd,
    TrailingBytes,
    NonCanonicalVarInt,
    InvalidUtf8,
    InvalidValue(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEnd => write!(f, "unexpected end of input"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after value"),
            DecodeError::NonCanonicalVarInt => write!(f, "non-canonical compact size"),
            DecodeError::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            DecodeError::InvalidValue(what) => write!(f, "invalid value: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(u8::from(value));
    }

    pub fn write_u16_be(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32_le(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_hash(&mut self, hash: &Hash256) {
        self.buffer.extend_from_slice(hash);
    }

    pub fn write_varint(&mut self, value: u64) {
        if value < 0xfd {
            self.buffer.push(value as u8);
        } else if value <= u64::from(u16::MAX) {
            self.buffer.push(0xfd);
            self.buffer.extend_from_slice(&(value as u16).to_le_bytes());
        } else if value <= u64::from(u32::MAX) {
            self.buffer.push(0xfe);
            self.buffer.extend_from_slice(&(value as u32).to_le_bytes());
        } else {
            self.buffer.push(0xff);
            self.buffer.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_var_str(&mut self, value: &str) {
        self.write_var_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < count {
            return Err(DecodeError::UnexpectedEnd);
        }
        let slice = &self.input[self.cursor..self.cursor + count];
        self.cursor += count;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_fixed::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue("boolean")),
        }
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_fixed::<2>()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_fixed::<4>()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_fixed::<8>()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let prefix = self.read_u8()?;
        let value = match prefix {
            0xfd => {
                let value = u64::from(u16::from_le_bytes(self.read_fixed::<2>()?));
                if value < 0xfd {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xfe => {
                let value = u64::from(u32::from_le_bytes(self.read_fixed::<4>()?));
                if value <= u64::from(u16::MAX) {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            0xff => {
                let value = u64::from_le_bytes(self.read_fixed::<8>()?);
                if value <= u64::from(u32::MAX) {
                    return Err(DecodeError::NonCanonicalVarInt);
                }
                value
            }
            byte => u64::from(byte),
        };
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let length = self.read_varint()?;
        let length = usize::try_from(length).map_err(|_| DecodeError::UnexpectedEnd)?;
        Ok(self.read_bytes(length)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    /// Decode a value that must span the whole input.
    fn decode_all(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = Self::consensus_decode(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_uses_smallest_prefix() {
        let mut encoder = Encoder::new();
        encoder.write_varint(0xfc);
        encoder.write_varint(0xfd);
        encoder.write_varint(0x1_0000);
        let bytes = encoder.into_inner();
        assert_eq!(bytes[0], 0xfc);
        assert_eq!(bytes[1], 0xfd);
        assert_eq!(bytes[4], 0xfe);

        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_varint().expect("fc"), 0xfc);
        assert_eq!(decoder.read_varint().expect("fd"), 0xfd);
        assert_eq!(decoder.read_varint().expect("fe"), 0x1_0000);
        assert!(decoder.is_empty());
    }

    #[test]
    fn non_canonical_varint_is_rejected() {
        // 0xfd prefix carrying a value below 0xfd
        let bytes = [0xfd, 0x10, 0x00];
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(decoder.read_varint(), Err(DecodeError::NonCanonicalVarInt));
    }

    #[test]
    fn truncated_read_reports_end() {
        let mut decoder = Decoder::new(&[0x01, 0x02]);
        assert_eq!(decoder.read_u32_le(), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn var_str_round_trips() {
        let mut encoder = Encoder::new();
        encoder.write_var_str("CMasternodeMan-Version-8");
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        assert_eq!(
            decoder.read_var_str().expect("string"),
            "CMasternodeMan-Version-8"
        );
    }
}
