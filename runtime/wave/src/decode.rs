//! # Byte-Stream Decoder
//!
//! Cursor over a borrowed byte slice. Every read is bounds-checked against the
//! slice it was created from, so a section or function body reader can never
//! run past its declared length.

use thiserror::Error;

use crate::WasmType;

/// Decoding failure, always tagged with the offset it happened at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset} ({needed} more bytes needed)")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("LEB128 value at offset {offset} exceeds {bits} bits")]
    LebOverflow { offset: usize, bits: u32 },
    #[error("invalid UTF-8 in name at offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("invalid value type 0x{byte:02x} at offset {offset}")]
    InvalidValueType { offset: usize, byte: u8 },
}

/// Bounds-checked reader.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Absolute offset of `bytes[0]` in the enclosing stream, for diagnostics.
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            base: 0,
        }
    }

    /// Absolute offset of the cursor.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    /// Bytes left before the end of this reader.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn eof(&self, needed: usize) -> DecodeError {
        DecodeError::UnexpectedEof {
            offset: self.offset(),
            needed: needed - self.remaining(),
        }
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or_else(|| self.eof(1))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a fixed-width little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a fixed-width little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Borrow the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(self.eof(len));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Split off a reader over the next `len` bytes and advance past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>, DecodeError> {
        let base = self.offset();
        let bytes = self.read_bytes(len)?;
        Ok(Reader { bytes, pos: 0, base })
    }

    /// Consume everything that is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        rest
    }

    /// Unsigned LEB128, at most `ceil(bits / 7)` bytes. Bits past `bits` in
    /// the final byte must be zero.
    fn read_unsigned(&mut self, bits: u32) -> Result<u64, DecodeError> {
        let start = self.offset();
        let mut result = 0u64;
        let mut shift = 0u32;

        loop {
            let byte = self.read_u8()?;
            if bits - shift < 7 && (byte & 0x7F) >> (bits - shift) != 0 {
                return Err(DecodeError::LebOverflow { offset: start, bits });
            }
            result |= u64::from(byte & 0x7F) << shift;

            if byte & 0x80 == 0 {
                break;
            }

            shift += 7;
            if shift >= bits {
                return Err(DecodeError::LebOverflow { offset: start, bits });
            }
        }

        Ok(result)
    }

    /// Signed LEB128. The result is sign-extended from the last consumed bit.
    fn read_signed(&mut self, bits: u32) -> Result<i64, DecodeError> {
        let start = self.offset();
        let mut result = 0i64;
        let mut shift = 0u32;
        let mut byte;

        loop {
            byte = self.read_u8()?;
            if bits - shift < 7 {
                // The unused high bits must repeat the sign bit.
                let unused = 0x7F & !((1u8 << (bits - shift - 1)) - 1);
                let high = byte & unused;
                if high != 0 && high != unused {
                    return Err(DecodeError::LebOverflow { offset: start, bits });
                }
            }
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;

            if byte & 0x80 == 0 {
                break;
            }

            if shift >= bits {
                return Err(DecodeError::LebOverflow { offset: start, bits });
            }
        }

        // Sign extend
        if shift < 64 && (byte & 0x40) != 0 {
            result |= !0 << shift;
        }

        Ok(result)
    }

    pub fn read_var_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.read_unsigned(32)? as u32)
    }

    pub fn read_var_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_signed(32)? as i32)
    }

    pub fn read_var_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_signed(64)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_name(&mut self) -> Result<String, DecodeError> {
        let offset = self.offset();
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }

    /// One of the four MVP value types.
    pub fn read_value_type(&mut self) -> Result<WasmType, DecodeError> {
        let offset = self.offset();
        let byte = self.read_u8()?;
        WasmType::from_byte(byte).ok_or(DecodeError::InvalidValueType { offset, byte })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_leb() {
        let mut r = Reader::new(&[0xE5, 0x8E, 0x26, 0x7F]);
        assert_eq!(r.read_var_u32().unwrap(), 624_485);
        assert_eq!(r.read_var_u32().unwrap(), 127);
        assert!(r.is_empty());
    }

    #[test]
    fn test_signed_leb_sign_extension() {
        let mut r = Reader::new(&[0x7F, 0xC0, 0xBB, 0x78, 0x80, 0x7F]);
        assert_eq!(r.read_var_i32().unwrap(), -1);
        assert_eq!(r.read_var_i32().unwrap(), -123_456);
        assert_eq!(r.read_var_i64().unwrap(), -128);
    }

    #[test]
    fn test_signed_leb_extremes() {
        let mut r = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x78]);
        assert_eq!(r.read_var_i32().unwrap(), i32::MIN);

        let mut r = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F]);
        assert_eq!(r.read_var_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn test_leb_too_long() {
        let mut r = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(
            r.read_var_u32(),
            Err(DecodeError::LebOverflow { offset: 0, bits: 32 })
        ));
    }

    #[test]
    fn test_leb_final_byte_unused_bits() {
        let mut r = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(r.read_var_u32().unwrap(), u32::MAX);

        let mut r = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x10]);
        assert!(matches!(
            r.read_var_u32(),
            Err(DecodeError::LebOverflow { offset: 0, bits: 32 })
        ));

        let mut r = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert_eq!(r.read_var_i32().unwrap(), -1);

        let mut r = Reader::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x4F]);
        assert!(r.read_var_i32().is_err());

        let mut r = Reader::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert!(r.read_var_i64().is_err());
    }

    #[test]
    fn test_truncation_is_reported() {
        let mut r = Reader::new(&[0x01, 0x02]);
        assert!(matches!(
            r.read_u32(),
            Err(DecodeError::UnexpectedEof { offset: 0, needed: 2 })
        ));

        let mut r = Reader::new(&[0x80]);
        assert!(r.read_var_u32().is_err());
    }

    #[test]
    fn test_sub_reader_is_bounded() {
        let mut r = Reader::new(&[0xAA, 0x02, 0x03, 0x04, 0x05]);
        r.read_u8().unwrap();
        let mut sub = r.sub_reader(2).unwrap();
        assert_eq!(sub.offset(), 1);
        assert_eq!(sub.read_u8().unwrap(), 0x02);
        assert_eq!(sub.read_u8().unwrap(), 0x03);
        assert!(sub.read_u8().is_err());
        assert_eq!(r.read_u8().unwrap(), 0x04);
    }

    #[test]
    fn test_read_name_and_value_type() {
        let mut r = Reader::new(&[0x03, b'e', b'n', b'v', 0x7E, 0x40]);
        assert_eq!(r.read_name().unwrap(), "env");
        assert_eq!(r.read_value_type().unwrap(), WasmType::I64);
        assert!(matches!(
            r.read_value_type(),
            Err(DecodeError::InvalidValueType { byte: 0x40, .. })
        ));
    }
}
