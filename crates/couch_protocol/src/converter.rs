//! Fixed-width integer and string conversion over byte buffers.
//!
//! Every reader takes an explicit `big_endian` flag: frame headers and counter
//! values are big-endian, document scalars are little-endian.

use bytes::{BufMut, BytesMut};

use couch_common::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteConverter;

fn read_fixed<const N: usize>(buf: &[u8]) -> Result<[u8; N]> {
    if buf.len() < N {
        return Err(ProtocolError::Truncated {
            expected: N,
            actual: buf.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&buf[..N]);
    Ok(arr)
}

impl ByteConverter {
    pub fn new() -> Self {
        Self
    }

    // ── Readers ──────────────────────────────────────────────────────────

    pub fn to_i16(&self, buf: &[u8], big_endian: bool) -> Result<i16> {
        let b = read_fixed::<2>(buf)?;
        Ok(if big_endian {
            i16::from_be_bytes(b)
        } else {
            i16::from_le_bytes(b)
        })
    }

    pub fn to_u16(&self, buf: &[u8], big_endian: bool) -> Result<u16> {
        let b = read_fixed::<2>(buf)?;
        Ok(if big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    pub fn to_i32(&self, buf: &[u8], big_endian: bool) -> Result<i32> {
        let b = read_fixed::<4>(buf)?;
        Ok(if big_endian {
            i32::from_be_bytes(b)
        } else {
            i32::from_le_bytes(b)
        })
    }

    pub fn to_u32(&self, buf: &[u8], big_endian: bool) -> Result<u32> {
        let b = read_fixed::<4>(buf)?;
        Ok(if big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    pub fn to_i64(&self, buf: &[u8], big_endian: bool) -> Result<i64> {
        let b = read_fixed::<8>(buf)?;
        Ok(if big_endian {
            i64::from_be_bytes(b)
        } else {
            i64::from_le_bytes(b)
        })
    }

    pub fn to_u64(&self, buf: &[u8], big_endian: bool) -> Result<u64> {
        let b = read_fixed::<8>(buf)?;
        Ok(if big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    pub fn to_string(&self, buf: &[u8], field: &str) -> Result<String> {
        String::from_utf8(buf.to_vec()).map_err(|e| ProtocolError::InvalidUtf8 {
            field: field.to_string(),
            source: e,
        })
    }

    // ── Writers ──────────────────────────────────────────────────────────

    pub fn from_i16(&self, value: i16, big_endian: bool, out: &mut BytesMut) {
        if big_endian {
            out.put_i16(value)
        } else {
            out.put_i16_le(value)
        }
    }

    pub fn from_u16(&self, value: u16, big_endian: bool, out: &mut BytesMut) {
        if big_endian {
            out.put_u16(value)
        } else {
            out.put_u16_le(value)
        }
    }

    pub fn from_i32(&self, value: i32, big_endian: bool, out: &mut BytesMut) {
        if big_endian {
            out.put_i32(value)
        } else {
            out.put_i32_le(value)
        }
    }

    pub fn from_u32(&self, value: u32, big_endian: bool, out: &mut BytesMut) {
        if big_endian {
            out.put_u32(value)
        } else {
            out.put_u32_le(value)
        }
    }

    pub fn from_i64(&self, value: i64, big_endian: bool, out: &mut BytesMut) {
        if big_endian {
            out.put_i64(value)
        } else {
            out.put_i64_le(value)
        }
    }

    pub fn from_u64(&self, value: u64, big_endian: bool, out: &mut BytesMut) {
        if big_endian {
            out.put_u64(value)
        } else {
            out.put_u64_le(value)
        }
    }

    pub fn from_string(&self, value: &str, out: &mut BytesMut) {
        out.put_slice(value.as_bytes());
    }

    // ── Bit helpers ──────────────────────────────────────────────────────

    pub fn get_bit(&self, byte: u8, position: u8) -> bool {
        byte & (1 << position) != 0
    }

    pub fn set_bit(&self, byte: &mut u8, position: u8, value: bool) {
        if value {
            *byte |= 1 << position;
        } else {
            *byte &= !(1 << position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u64_byte_order() {
        let conv = ByteConverter::new();
        let mut be = BytesMut::new();
        conv.from_u64(1, true, &mut be);
        assert_eq!(&be[..], &[0, 0, 0, 0, 0, 0, 0, 1]);

        let mut le = BytesMut::new();
        conv.from_u64(1, false, &mut le);
        assert_eq!(&le[..], &[1, 0, 0, 0, 0, 0, 0, 0]);

        assert_eq!(conv.to_u64(&be, true).unwrap(), 1);
        assert_eq!(conv.to_u64(&le, false).unwrap(), 1);
        assert_eq!(conv.to_u64(&be, false).unwrap(), 1 << 56);
    }

    #[test]
    fn test_signed_values() {
        let conv = ByteConverter::new();
        let mut out = BytesMut::new();
        conv.from_i16(-2, false, &mut out);
        conv.from_i32(-70_000, true, &mut out);
        assert_eq!(conv.to_i16(&out[..2], false).unwrap(), -2);
        assert_eq!(conv.to_i32(&out[2..], true).unwrap(), -70_000);
    }

    #[test]
    fn test_short_buffer_is_truncated() {
        let conv = ByteConverter::new();
        let err = conv.to_u32(&[1, 2], false).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 4,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let conv = ByteConverter::new();
        let err = conv.to_string(&[0xff, 0xfe], "value").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8 { .. }));
    }

    #[test]
    fn test_bits() {
        let conv = ByteConverter::new();
        let mut b = 0u8;
        conv.set_bit(&mut b, 1, true);
        conv.set_bit(&mut b, 4, true);
        assert_eq!(b, 0b0001_0010);
        assert!(conv.get_bit(b, 4));
        conv.set_bit(&mut b, 4, false);
        assert!(!conv.get_bit(b, 4));
    }
}
