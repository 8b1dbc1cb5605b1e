//! Conversions between the data object types
//!
//! Implicit conversions follow the reference-interpreter contracts: strings
//! parse as hexadecimal, integers render as zero-padded uppercase hex at
//! the declared width, buffers truncate or extend per the consumer. The
//! explicit conversion operators (`ToInteger`, `ToHexString`, ...) reuse
//! these with their own entry points.

use crate::error::{AmlError, MethodAbort};
use crate::object::{IntegerWidth, Object, ObjectType};

/// Coerce a data object to an integer at `width`.
///
/// Strings parse a hexadecimal prefix; buffers read up to eight little
/// endian bytes. Non-data types fail with a type mismatch.
pub fn to_integer(value: &Object, width: IntegerWidth) -> Result<u64, MethodAbort> {
    let out = match value {
        Object::Integer(v) => *v,
        Object::String(bytes) => parse_string_integer(bytes, false),
        Object::Buffer(bytes) => integer_from_bytes(bytes),
        other => {
            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Integer,
                found: other.type_of(),
            }))
        }
    };
    Ok(out & width.mask())
}

/// Little-endian integer from up to the first eight bytes.
pub(crate) fn integer_from_bytes(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i)))
}

/// Parse an integer from string bytes.
///
/// Implicit conversions (`explicit == false`) always parse hexadecimal, with
/// or without a `0x` prefix. The explicit `ToInteger` operator parses
/// decimal unless the prefix is present. Parsing stops at the first
/// non-digit; no digits yields zero.
pub fn parse_string_integer(bytes: &[u8], explicit: bool) -> u64 {
    let trimmed = match bytes {
        [b' ' | b'\t', ..] => {
            let skip = bytes
                .iter()
                .take_while(|b| **b == b' ' || **b == b'\t')
                .count();
            &bytes[skip..]
        }
        _ => bytes,
    };
    let (digits, radix) = match trimmed {
        [b'0', b'x' | b'X', rest @ ..] => (rest, 16),
        _ if explicit => (trimmed, 10),
        _ => (trimmed, 16),
    };
    let mut value = 0u64;
    for byte in digits {
        let digit = match (*byte as char).to_digit(radix) {
            Some(d) => d as u64,
            None => break,
        };
        value = value.wrapping_mul(radix as u64).wrapping_add(digit);
    }
    value
}

/// Coerce a data object to a byte image.
///
/// Integers produce their little-endian image at `width`; strings append
/// the terminating nul the external representation carries.
pub fn to_buffer(value: &Object, width: IntegerWidth) -> Result<Vec<u8>, MethodAbort> {
    match value {
        Object::Integer(v) => Ok(v.to_le_bytes()[..width.bytes()].to_vec()),
        Object::String(bytes) => {
            let mut out = bytes.clone();
            out.push(0);
            Ok(out)
        }
        Object::Buffer(bytes) => Ok(bytes.clone()),
        other => Err(MethodAbort::Error(AmlError::TypeMismatch {
            expected: ObjectType::Buffer,
            found: other.type_of(),
        })),
    }
}

/// Coerce a data object to string bytes.
///
/// Integers render as zero-padded uppercase hex at `width`; buffers render
/// as comma-separated `0xNN` byte values.
pub fn to_string_value(value: &Object, width: IntegerWidth) -> Result<Vec<u8>, MethodAbort> {
    match value {
        Object::String(bytes) => Ok(bytes.clone()),
        Object::Integer(v) => Ok(integer_to_hex_string(*v, width)),
        Object::Buffer(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() * 5);
            for (i, byte) in bytes.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(format!("0x{byte:02X}").as_bytes());
            }
            Ok(out)
        }
        other => Err(MethodAbort::Error(AmlError::TypeMismatch {
            expected: ObjectType::String,
            found: other.type_of(),
        })),
    }
}

/// Zero-padded uppercase hexadecimal rendering at `width`.
pub fn integer_to_hex_string(value: u64, width: IntegerWidth) -> Vec<u8> {
    let digits = width.bytes() * 2;
    format!("{value:0digits$X}").into_bytes()
}

/// Decimal rendering without padding.
pub fn integer_to_decimal_string(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"0x1A", false, 0x1a)]
    #[case(b"1A", false, 0x1a)]
    #[case(b"10", false, 0x10)]
    #[case(b"10", true, 10)]
    #[case(b"0x10", true, 0x10)]
    #[case(b"  FFzz", false, 0xff)]
    #[case(b"", false, 0)]
    #[case(b"junk", false, 0)]
    fn string_parsing(#[case] text: &[u8], #[case] explicit: bool, #[case] expected: u64) {
        assert_eq!(parse_string_integer(text, explicit), expected);
    }

    #[test]
    fn integer_coercion_masks_to_width() {
        let value = Object::Integer(0x2345_6789_abcd_ef01);
        assert_eq!(
            to_integer(&value, IntegerWidth::Full).unwrap(),
            0x2345_6789_abcd_ef01
        );
        assert_eq!(
            to_integer(&value, IntegerWidth::Legacy).unwrap(),
            0xabcd_ef01
        );
    }

    #[test]
    fn buffer_coercion_reads_little_endian() {
        let value = Object::Buffer(vec![0x01, 0x02]);
        assert_eq!(to_integer(&value, IntegerWidth::Full).unwrap(), 0x0201);
        let long = Object::Buffer((1..=9).collect());
        assert_eq!(
            to_integer(&long, IntegerWidth::Full).unwrap(),
            0x0807_0605_0403_0201
        );
    }

    #[test]
    fn string_to_buffer_appends_nul() {
        let value = Object::string("AB");
        assert_eq!(
            to_buffer(&value, IntegerWidth::Full).unwrap(),
            vec![b'A', b'B', 0]
        );
    }

    #[test]
    fn integer_to_buffer_sizes_by_width() {
        let value = Object::Integer(0x0102);
        assert_eq!(
            to_buffer(&value, IntegerWidth::Legacy).unwrap(),
            vec![0x02, 0x01, 0, 0]
        );
        assert_eq!(to_buffer(&value, IntegerWidth::Full).unwrap().len(), 8);
    }

    #[test]
    fn hex_rendering_is_padded_uppercase() {
        assert_eq!(
            integer_to_hex_string(0xbeef, IntegerWidth::Full),
            b"000000000000BEEF".to_vec()
        );
        assert_eq!(
            integer_to_hex_string(0xbeef, IntegerWidth::Legacy),
            b"0000BEEF".to_vec()
        );
    }

    #[test]
    fn buffer_to_string_lists_bytes() {
        let value = Object::Buffer(vec![0xab, 0x01]);
        assert_eq!(
            to_string_value(&value, IntegerWidth::Full).unwrap(),
            b"0xAB,0x01".to_vec()
        );
    }

    #[test]
    fn non_data_types_mismatch() {
        assert!(to_integer(&Object::Device, IntegerWidth::Full).is_err());
        assert!(to_buffer(&Object::Debug, IntegerWidth::Full).is_err());
    }
}
