//! Constant-expression evaluator for global initializers and segment offsets.
//!
//! The MVP expression language is a single `*.const` instruction followed by
//! `end`.

use crate::decode::Reader;
use crate::{WasmValue, WaveError};

/// Evaluate one constant expression, consuming its terminating `end`.
pub fn evaluate(reader: &mut Reader<'_>) -> Result<WasmValue, WaveError> {
    let offset = reader.offset();
    let opcode = reader.read_u8()?;
    let value = match opcode {
        0x41 => WasmValue::I32(reader.read_var_i32()?), // i32.const
        0x42 => WasmValue::I64(reader.read_var_i64()?), // i64.const
        0x43 => WasmValue::F32(f32::from_bits(reader.read_u32()?)), // f32.const
        0x44 => WasmValue::F64(f64::from_bits(reader.read_u64()?)), // f64.const
        0x23 => {
            return Err(WaveError::Unsupported(format!(
                "get_global in constant expression at offset {}",
                offset
            )))
        }
        other => {
            return Err(WaveError::Format(format!(
                "invalid constant expression opcode 0x{:02x} at offset {}",
                other, offset
            )))
        }
    };

    let end = reader.read_u8()?;
    if end != 0x0B {
        return Err(WaveError::Format(format!(
            "constant expression at offset {} is not terminated by end",
            offset
        )));
    }

    Ok(value)
}

/// Evaluate an expression that must produce an i32, as used for offsets.
pub fn evaluate_offset(reader: &mut Reader<'_>) -> Result<u32, WaveError> {
    match evaluate(reader)? {
        WasmValue::I32(v) => Ok(v as u32),
        other => Err(WaveError::Format(format!(
            "segment offset must be i32, found {}",
            other.value_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_constants() {
        let mut r = Reader::new(&[0x41, 0x2A, 0x0B, 0x42, 0x7F, 0x0B]);
        assert_eq!(evaluate(&mut r).unwrap(), WasmValue::I32(42));
        assert_eq!(evaluate(&mut r).unwrap(), WasmValue::I64(-1));
        assert!(r.is_empty());
    }

    #[test]
    fn test_float_constants() {
        let mut bytes = vec![0x43];
        bytes.extend_from_slice(&1.5f32.to_bits().to_le_bytes());
        bytes.push(0x0B);
        bytes.push(0x44);
        bytes.extend_from_slice(&(-0.25f64).to_bits().to_le_bytes());
        bytes.push(0x0B);

        let mut r = Reader::new(&bytes);
        assert_eq!(evaluate(&mut r).unwrap(), WasmValue::F32(1.5));
        assert_eq!(evaluate(&mut r).unwrap(), WasmValue::F64(-0.25));
    }

    #[test]
    fn test_missing_end_is_rejected() {
        let mut r = Reader::new(&[0x41, 0x01, 0x01]);
        assert!(matches!(evaluate(&mut r), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let mut r = Reader::new(&[0x6A, 0x0B]);
        assert!(matches!(evaluate(&mut r), Err(WaveError::Format(_))));
    }

    #[test]
    fn test_offset_requires_i32() {
        let mut r = Reader::new(&[0x41, 0x80, 0x02, 0x0B]);
        assert_eq!(evaluate_offset(&mut r).unwrap(), 256);

        let mut r = Reader::new(&[0x42, 0x00, 0x0B]);
        assert!(evaluate_offset(&mut r).is_err());
    }
}
