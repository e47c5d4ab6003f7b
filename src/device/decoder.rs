//! Best-effort decoding of load-cell payloads.
//!
//! Peripheral firmware differs in how it encodes a force sample, so the payload is sniffed.
//! The interpretations are attempted in a fixed order and the first one that fits wins:
//!
//! 1. numeric text (`"12.34"`, `" -3 \n"`), any length
//! 2. little-endian `f32` from the first 4 bytes
//! 3. little-endian `i16` from the first 2 bytes
//!
//! The order is observable behaviour: a 4 byte payload that is not numeric text is always read
//! as a float, never as a short.

use std::str;

use crate::error::DecodeError;

pub fn decode(bytes: &[u8]) -> Result<f64, DecodeError> {
    decode_text(bytes)
        .or_else(|| decode_f32(bytes))
        .or_else(|| decode_i16(bytes))
        .ok_or(DecodeError::Unrecognized { length: bytes.len() })
}

fn decode_text(bytes: &[u8]) -> Option<f64> {
    let text = str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    // "inf" and "nan" parse as f64, but they are not something a firmware sends as text
    if !text.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }

    text.parse::<f64>().ok()
}

// NaN and infinity are passed through as-is
fn decode_f32(bytes: &[u8]) -> Option<f64> {
    let raw: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    Some(f64::from(f32::from_le_bytes(raw)))
}

fn decode_i16(bytes: &[u8]) -> Option<f64> {
    let raw: [u8; 2] = bytes.get(..2)?.try_into().ok()?;
    Some(f64::from(i16::from_le_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_text_is_parsed_exactly() {
        assert_eq!(decode(b"12.34").unwrap(), 12.34);
        assert_eq!(decode(b" -3 \n").unwrap(), -3.0);
        assert_eq!(decode(b"5").unwrap(), 5.0);
        assert_eq!(decode(b"1234567.5").unwrap(), 1234567.5);
    }

    #[test]
    fn text_wins_over_binary_for_long_buffers() {
        // "1000" would be 0x30303031 as a float
        assert_eq!(decode(b"1000").unwrap(), 1000.0);
    }

    #[test]
    fn four_bytes_are_a_little_endian_float() {
        let bytes = 2.5_f32.to_le_bytes();
        assert_eq!(decode(&bytes).unwrap(), 2.5);

        let mut longer = (-12.25_f32).to_le_bytes().to_vec();
        longer.extend_from_slice(&[0xff, 0x00, 0x13]);
        assert_eq!(decode(&longer).unwrap(), -12.25);
    }

    #[test]
    fn zero_float_payload() {
        assert_eq!(decode(&[0x00, 0x00, 0x00, 0x00]).unwrap(), 0.0);
    }

    #[test]
    fn four_bytes_never_fall_through_to_short() {
        // 0x41200001 as f32 is just above 10.0, the first two bytes as i16 would be 1
        let bytes = [0x01, 0x00, 0x20, 0x41];
        let value = decode(&bytes).unwrap();
        assert_ne!(value, 1.0);
        assert!((value - 10.0).abs() < 1e-5);

        assert!(decode(&[0x00, 0x00, 0x80, 0x7f]).unwrap().is_infinite());
    }

    #[test]
    fn nan_is_passed_through() {
        let value = decode(&f32::NAN.to_le_bytes()).unwrap();
        assert!(value.is_nan());
    }

    #[test]
    fn two_and_three_bytes_are_a_little_endian_short() {
        assert_eq!(decode(&[0xff, 0xff]).unwrap(), -1.0);
        assert_eq!(decode(&[0x34, 0x12, 0xaa]).unwrap(), 4660.0);
    }

    #[test]
    fn two_byte_text_is_still_text() {
        assert_eq!(decode(b"42").unwrap(), 42.0);
    }

    #[test]
    fn short_garbage_is_unrecognized() {
        assert_eq!(decode(&[]), Err(DecodeError::Unrecognized { length: 0 }));
        assert_eq!(decode(&[0xfe]), Err(DecodeError::Unrecognized { length: 1 }));
        assert_eq!(decode(b" "), Err(DecodeError::Unrecognized { length: 1 }));
    }

    #[test]
    fn single_digit_text_is_recognized() {
        assert_eq!(decode(b"7").unwrap(), 7.0);
    }
}
