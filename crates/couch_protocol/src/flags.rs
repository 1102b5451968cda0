//! Format descriptor carried with every stored value.
//!
//! Wire layout of the 32-bit flags word (big-endian in the frame extras):
//!
//! ```text
//! byte 0: [0][compression: 3 bits][data format: 4 bits]
//! byte 1: reserved
//! byte 2: reserved
//! byte 3: type tag
//! ```

use std::fmt;

use couch_common::error::ProtocolError;

/// Encoding family of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataFormat {
    Reserved = 0,
    Private = 1,
    Json = 2,
    Binary = 3,
    String = 4,
}

impl DataFormat {
    pub fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::Reserved),
            1 => Ok(Self::Private),
            2 => Ok(Self::Json),
            3 => Ok(Self::Binary),
            4 => Ok(Self::String),
            other => Err(ProtocolError::UnknownDataFormat(other)),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Value compression. Only uncompressed payloads are produced or accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
}

impl Compression {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::None),
            other => Err(ProtocolError::UnsupportedCompression(other)),
        }
    }
}

/// Scalar type of the encoded value, stored in the low byte of the flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    #[default]
    Empty = 0,
    Object = 1,
    Boolean = 3,
    Char = 4,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Double = 14,
    DateTime = 16,
    String = 18,
}

impl TypeTag {
    /// Unknown tags decode as `Object`, which routes the value through JSON.
    pub fn from_u8(b: u8) -> Self {
        match b {
            0 => Self::Empty,
            3 => Self::Boolean,
            4 => Self::Char,
            7 => Self::Int16,
            8 => Self::UInt16,
            9 => Self::Int32,
            10 => Self::UInt32,
            11 => Self::Int64,
            12 => Self::UInt64,
            14 => Self::Double,
            16 => Self::DateTime,
            18 => Self::String,
            _ => Self::Object,
        }
    }
}

/// `{ dataFormat, compression, typeTag }` for one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags {
    pub data_format: DataFormat,
    pub compression: Compression,
    pub type_tag: TypeTag,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new(DataFormat::Reserved, TypeTag::Empty)
    }
}

impl Flags {
    pub fn new(data_format: DataFormat, type_tag: TypeTag) -> Self {
        Self {
            data_format,
            compression: Compression::None,
            type_tag,
        }
    }

    pub fn json(type_tag: TypeTag) -> Self {
        Self::new(DataFormat::Json, type_tag)
    }

    pub fn string() -> Self {
        Self::new(DataFormat::String, TypeTag::String)
    }

    pub fn binary() -> Self {
        Self::new(DataFormat::Binary, TypeTag::Object)
    }

    pub fn to_u32(self) -> u32 {
        let head = (self.data_format as u32 & 0x0f) | ((self.compression as u32 & 0x07) << 4);
        (head << 24) | self.type_tag as u32
    }

    pub fn from_u32(raw: u32) -> Result<Self, ProtocolError> {
        let head = (raw >> 24) as u8;
        Ok(Self {
            data_format: DataFormat::from_u8(head & 0x0f)?,
            compression: Compression::from_byte((head >> 4) & 0x07)?,
            type_tag: TypeTag::from_u8((raw & 0xff) as u8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_flags_layout() {
        let flags = Flags::json(TypeTag::Object);
        assert_eq!(flags.to_u32(), 0x0200_0001);
        assert_eq!(Flags::from_u32(0x0200_0001).unwrap(), flags);
    }

    #[test]
    fn test_type_tag_in_low_byte() {
        let flags = Flags::new(DataFormat::Reserved, TypeTag::UInt64);
        assert_eq!(flags.to_u32(), 12);
        let flags = Flags::string();
        assert_eq!(flags.to_u32(), 0x0400_0012);
    }

    #[test]
    fn test_legacy_zero_flags() {
        let flags = Flags::from_u32(0).unwrap();
        assert_eq!(flags.data_format, DataFormat::Reserved);
        assert_eq!(flags.type_tag, TypeTag::Empty);
    }

    #[test]
    fn test_rejects_unknown_format_and_compression() {
        assert!(matches!(
            Flags::from_u32(0x0900_0000),
            Err(ProtocolError::UnknownDataFormat(9))
        ));
        assert!(matches!(
            Flags::from_u32(0x1200_0000),
            Err(ProtocolError::UnsupportedCompression(1))
        ));
    }

    #[test]
    fn test_unknown_type_tag_is_object() {
        assert_eq!(TypeTag::from_u8(0x42), TypeTag::Object);
    }
}
