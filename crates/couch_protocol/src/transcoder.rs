//! Value transcoding: typed `Value` <-> wire payload, steered by `Flags`.
//!
//! Scalars stored under `Reserved`/`Private`/`String` use fixed-width
//! little-endian layouts, except that an unsigned 64-bit value travelling with
//! an increment or decrement opcode is big-endian (the server's counter format).
//! `Json` payloads go through the pluggable [`JsonSerializer`]. `Binary`
//! payloads are passed through untouched.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use couch_common::config::NamingPolicy;
use couch_common::error::ProtocolError;

use crate::converter::ByteConverter;
use crate::flags::{DataFormat, Flags, TypeTag};
use crate::types::OpCode;
use crate::value::{single_char, Value};

type Result<T> = std::result::Result<T, ProtocolError>;

/// JSON collaborator. All `Json`-format work is delegated here.
pub trait JsonSerializer: Send + Sync {
    fn serialize(&self, value: &JsonValue) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue>;
}

/// `serde_json` serializer that rewrites object keys per a [`NamingPolicy`]
/// on the way out. Incoming documents are never rewritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSerializer {
    naming: NamingPolicy,
}

impl DefaultSerializer {
    pub fn new(naming: NamingPolicy) -> Self {
        Self { naming }
    }

    pub fn naming(&self) -> NamingPolicy {
        self.naming
    }

    fn rename_key(&self, key: &str) -> String {
        let mut chars = key.chars();
        match (self.naming, chars.next()) {
            (NamingPolicy::CamelCase, Some(first)) => {
                first.to_lowercase().chain(chars).collect()
            }
            (NamingPolicy::PascalCase, Some(first)) => {
                first.to_uppercase().chain(chars).collect()
            }
            _ => key.to_string(),
        }
    }

    fn apply_naming(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (self.rename_key(k), self.apply_naming(v)))
                    .collect(),
            ),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.apply_naming(v)).collect())
            }
            other => other.clone(),
        }
    }
}

impl JsonSerializer for DefaultSerializer {
    fn serialize(&self, value: &JsonValue) -> Result<Vec<u8>> {
        let out = match self.naming {
            NamingPolicy::AsIs => serde_json::to_vec(value)?,
            _ => serde_json::to_vec(&self.apply_naming(value))?,
        };
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub struct Transcoder {
    converter: ByteConverter,
    serializer: Arc<dyn JsonSerializer>,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder").finish_non_exhaustive()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self::with_serializer(Arc::new(DefaultSerializer::default()))
    }

    pub fn with_serializer(serializer: Arc<dyn JsonSerializer>) -> Self {
        Self {
            converter: ByteConverter::new(),
            serializer,
        }
    }

    pub fn converter(&self) -> &ByteConverter {
        &self.converter
    }

    /// Default flags for storing `value`.
    pub fn get_format(&self, value: &Value) -> Flags {
        match value {
            Value::Text(_) => Flags::string(),
            Value::Char(_) => Flags::new(DataFormat::String, TypeTag::Char),
            Value::Bytes(_) => Flags::binary(),
            other => Flags::json(other.type_tag()),
        }
    }

    pub fn encode(&self, value: &Value, flags: Flags, opcode: OpCode) -> Result<Bytes> {
        let mut out = BytesMut::new();
        match flags.data_format {
            DataFormat::Reserved | DataFormat::Private | DataFormat::String => {
                self.encode_scalar(value, flags.data_format, opcode, &mut out)?
            }
            DataFormat::Json => out.extend_from_slice(&self.serializer.serialize(&value.to_json())?),
            DataFormat::Binary => match value {
                Value::Bytes(b) => out.extend_from_slice(b),
                other => {
                    return Err(ProtocolError::TypeMismatch {
                        format: DataFormat::Binary.to_string(),
                        value_type: other.type_name().to_string(),
                    })
                }
            },
        }
        Ok(out.freeze())
    }

    fn encode_scalar(
        &self,
        value: &Value,
        format: DataFormat,
        opcode: OpCode,
        out: &mut BytesMut,
    ) -> Result<()> {
        let c = &self.converter;
        match value {
            Value::Null => {}
            Value::Text(s) => c.from_string(s, out),
            Value::Char(ch) => c.from_string(ch.encode_utf8(&mut [0u8; 4]), out),
            Value::Int16(v) => c.from_i16(*v, false, out),
            Value::UInt16(v) => c.from_u16(*v, false, out),
            Value::Int32(v) => c.from_i32(*v, false, out),
            Value::UInt32(v) => c.from_u32(*v, false, out),
            Value::Int64(v) => c.from_i64(*v, false, out),
            Value::UInt64(v) => c.from_u64(*v, opcode.is_counter(), out),
            Value::Bytes(b) if format != DataFormat::String => out.extend_from_slice(b),
            Value::Bytes(_) => {
                return Err(ProtocolError::TypeMismatch {
                    format: format.to_string(),
                    value_type: value.type_name().to_string(),
                })
            }
            Value::Boolean(_) | Value::Double(_) | Value::DateTime(_) | Value::Json(_) => {
                out.extend_from_slice(&self.serializer.serialize(&value.to_json())?)
            }
        }
        Ok(())
    }

    /// Decode using the type tag carried in `flags`.
    pub fn decode(&self, buf: &[u8], flags: Flags, opcode: OpCode) -> Result<Value> {
        self.decode_as(buf, flags, opcode, flags.type_tag)
    }

    /// Decode, overriding the wire type tag with `target`.
    pub fn decode_as(
        &self,
        buf: &[u8],
        flags: Flags,
        opcode: OpCode,
        target: TypeTag,
    ) -> Result<Value> {
        match flags.data_format {
            DataFormat::Binary => Ok(Value::Bytes(buf.to_vec())),
            DataFormat::Json => self.decode_json_value(buf, target),
            format => self.decode_scalar(buf, format, opcode, target),
        }
    }

    fn decode_json_value(&self, buf: &[u8], target: TypeTag) -> Result<Value> {
        if buf.is_empty() {
            return Ok(Value::Null);
        }
        match target {
            // A whole document read as text yields the raw JSON text; a JSON
            // string literal yields its contents.
            TypeTag::String | TypeTag::Char => {
                let text = match self.serializer.deserialize(buf) {
                    Ok(JsonValue::String(s)) => s,
                    _ => self.converter.to_string(buf, "value")?,
                };
                if target == TypeTag::Char {
                    Ok(Value::Char(single_char(&text)?))
                } else {
                    Ok(Value::Text(text))
                }
            }
            _ => Value::from_json(self.serializer.deserialize(buf)?, target),
        }
    }

    fn decode_scalar(
        &self,
        buf: &[u8],
        format: DataFormat,
        opcode: OpCode,
        target: TypeTag,
    ) -> Result<Value> {
        if buf.is_empty() {
            return Ok(match (format, target) {
                (DataFormat::String, _) | (_, TypeTag::String) | (_, TypeTag::Char) => Value::Null,
                (_, TypeTag::Empty) | (_, TypeTag::Object) => Value::Bytes(Vec::new()),
                _ => Value::Null,
            });
        }
        let c = &self.converter;
        let value = match target {
            TypeTag::Empty | TypeTag::Object if format == DataFormat::String => {
                Value::Text(c.to_string(buf, "value")?)
            }
            TypeTag::Empty | TypeTag::Object => Value::Bytes(buf.to_vec()),
            TypeTag::String => Value::Text(c.to_string(buf, "value")?),
            TypeTag::Char => Value::Char(single_char(&c.to_string(buf, "value")?)?),
            TypeTag::Int16 => Value::Int16(c.to_i16(buf, false)?),
            TypeTag::UInt16 => Value::UInt16(c.to_u16(buf, false)?),
            TypeTag::Int32 => Value::Int32(c.to_i32(buf, false)?),
            TypeTag::UInt32 => Value::UInt32(c.to_u32(buf, false)?),
            TypeTag::Int64 => Value::Int64(c.to_i64(buf, false)?),
            TypeTag::UInt64 => Value::UInt64(c.to_u64(buf, opcode.is_counter())?),
            TypeTag::Boolean | TypeTag::Double | TypeTag::DateTime => {
                Value::from_json(self.serializer.deserialize(buf)?, target)?
            }
        };
        Ok(value)
    }

    /// Encode any serializable document as JSON, returning the payload and its flags.
    pub fn encode_json<T: Serialize>(&self, value: &T) -> Result<(Bytes, Flags)> {
        let json = serde_json::to_value(value)?;
        let bytes = self.serializer.serialize(&json)?;
        Ok((Bytes::from(bytes), Flags::json(TypeTag::Object)))
    }

    /// Decode a JSON payload into `T`. An empty payload is `None`.
    pub fn decode_json<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<Option<T>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let json = self.serializer.deserialize(buf)?;
        Ok(Some(serde_json::from_value(json)?))
    }
}
