//! Bit-level encodings of scalar element values.

use super::element::{Endian, StringType};
use crate::bitstream::{BitStream, BitStreamError};

pub fn mask(size: u32) -> u64 {
    if size >= 64 { u64::MAX } else { (1u64 << size) - 1 }
}

/// Interprets the low `size` bits of `raw` as two's complement.
pub fn sign_extend(raw: u64, size: u32) -> i64 {
    if size == 0 || size >= 64 {
        return raw as i64;
    }
    let shift = 64 - size;
    ((raw << shift) as i64) >> shift
}

/// Writes `size` bits of `raw` starting with the least significant byte. A
/// trailing partial byte carries the remaining high bits.
pub fn encode_le(raw: u64, size: u32) -> BitStream {
    let mut out = BitStream::new();
    let mut value = raw & mask(size);
    let mut left = size;
    while left >= 8 {
        out.write_bits(value & 0xff, 8);
        value >>= 8;
        left -= 8;
    }
    if left > 0 {
        out.write_bits(value & mask(left), left);
    }
    out
}

/// Inverse of [`encode_le`], reading from the current position of `data`.
pub fn decode_le(data: &mut BitStream, size: u32) -> Result<u64, BitStreamError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut left = size;
    while left >= 8 {
        value |= data.read_bits(8)? << shift;
        shift += 8;
        left -= 8;
    }
    if left > 0 {
        value |= data.read_bits(u64::from(left))? << shift;
    }
    Ok(value)
}

pub fn encode_integer(raw: u64, size: u32, endian: Endian) -> BitStream {
    match endian {
        Endian::Big => {
            let mut out = BitStream::new();
            out.write_bits(raw & mask(size), size);
            out
        }
        Endian::Little => encode_le(raw, size),
    }
}

pub fn decode_integer(
    data: &mut BitStream,
    size: u32,
    endian: Endian,
) -> Result<u64, BitStreamError> {
    match endian {
        Endian::Big => data.read_bits(u64::from(size)),
        Endian::Little => decode_le(data, size),
    }
}

pub fn encode_double(value: f64, size: u32, endian: Endian) -> BitStream {
    let raw = if size == 32 {
        u64::from((value as f32).to_bits())
    } else {
        value.to_bits()
    };
    encode_integer(raw, size, endian)
}

pub fn decode_double(
    data: &mut BitStream,
    size: u32,
    endian: Endian,
) -> Result<f64, BitStreamError> {
    let raw = decode_integer(data, size, endian)?;
    Ok(if size == 32 {
        f64::from(f32::from_bits(raw as u32))
    } else {
        f64::from_bits(raw)
    })
}

pub fn encode_string(text: &str, string_type: StringType) -> Result<Vec<u8>, String> {
    match string_type {
        StringType::Ascii => {
            if let Some(bad) = text.chars().find(|c| !c.is_ascii()) {
                return Err(format!("Character '{bad}' is not valid ASCII."));
            }
            Ok(text.as_bytes().to_vec())
        }
        StringType::Utf8 => Ok(text.as_bytes().to_vec()),
        StringType::Utf16 => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        StringType::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
        StringType::Utf32 => Ok(text.chars().flat_map(|c| u32::from(c).to_le_bytes()).collect()),
    }
}

pub fn decode_string(bytes: &[u8], string_type: StringType) -> Result<String, String> {
    let invalid = || format!("String contains invalid {} bytes.", string_type.tag().to_uppercase());
    match string_type {
        StringType::Ascii => {
            if bytes.iter().any(|b| !b.is_ascii()) {
                return Err(invalid());
            }
            Ok(bytes.iter().map(|b| char::from(*b)).collect())
        }
        StringType::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|_| invalid()),
        StringType::Utf16 | StringType::Utf16Be => {
            if bytes.len() % 2 != 0 {
                return Err(invalid());
            }
            let units = bytes.chunks_exact(2).map(|pair| {
                let pair = [pair[0], pair[1]];
                if string_type == StringType::Utf16 {
                    u16::from_le_bytes(pair)
                } else {
                    u16::from_be_bytes(pair)
                }
            });
            char::decode_utf16(units)
                .collect::<Result<String, _>>()
                .map_err(|_| invalid())
        }
        StringType::Utf32 => {
            if bytes.len() % 4 != 0 {
                return Err(invalid());
            }
            bytes
                .chunks_exact(4)
                .map(|quad| {
                    char::from_u32(u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
                })
                .collect::<Option<String>>()
                .ok_or_else(invalid)
        }
    }
}

/// Byte length of the UTF-8 sequence introduced by `lead`.
pub fn utf8_sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7f => Some(1),
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_puts_low_byte_first() {
        let bits = encode_integer(0x1234, 16, Endian::Little);
        assert_eq!(bits.as_bytes(), &[0x34, 0x12]);
        let mut data = bits.clone();
        assert_eq!(decode_integer(&mut data, 16, Endian::Little).unwrap(), 0x1234);
    }

    #[test]
    fn partial_little_endian_keeps_high_bits_last() {
        let bits = encode_le(0x5ab, 12);
        assert_eq!(bits.len_bits(), 12);
        let mut data = bits;
        assert_eq!(decode_le(&mut data, 12).unwrap(), 0x5ab);
    }

    #[test]
    fn sign_extension_respects_width() {
        assert_eq!(sign_extend(0xff, 8), -1);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0b100, 3), -4);
    }

    #[test]
    fn doubles_round_trip_in_both_widths() {
        let mut wide = encode_double(1.5, 64, Endian::Big);
        assert_eq!(decode_double(&mut wide, 64, Endian::Big).unwrap(), 1.5);
        let mut narrow = encode_double(-2.25, 32, Endian::Little);
        assert_eq!(narrow.len_bits(), 32);
        assert_eq!(decode_double(&mut narrow, 32, Endian::Little).unwrap(), -2.25);
    }

    #[test]
    fn utf16_variants_differ_in_byte_order() {
        assert_eq!(encode_string("A", StringType::Utf16).unwrap(), vec![0x41, 0x00]);
        assert_eq!(encode_string("A", StringType::Utf16Be).unwrap(), vec![0x00, 0x41]);
        assert_eq!(decode_string(&[0x41, 0x00, 0x42, 0x00], StringType::Utf16).unwrap(), "AB");
        assert!(decode_string(&[0x41], StringType::Utf16).is_err());
        assert!(encode_string("é", StringType::Ascii).is_err());
    }
}
