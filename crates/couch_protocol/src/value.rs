use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;

use couch_common::error::ProtocolError;

use crate::flags::TypeTag;

/// A document value as seen by the transcoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Char(char),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Text(String),
    DateTime(DateTime<Utc>),
    /// Raw byte sequence, stored verbatim.
    Bytes(Vec<u8>),
    /// Any other document, kept as a JSON tree.
    Json(JsonValue),
}

fn invalid_cast(target: TypeTag, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidCast {
        target: format!("{:?}", target),
        reason: reason.into(),
    }
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Empty,
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Char(_) => TypeTag::Char,
            Value::Int16(_) => TypeTag::Int16,
            Value::UInt16(_) => TypeTag::UInt16,
            Value::Int32(_) => TypeTag::Int32,
            Value::UInt32(_) => TypeTag::UInt32,
            Value::Int64(_) => TypeTag::Int64,
            Value::UInt64(_) => TypeTag::UInt64,
            Value::Double(_) => TypeTag::Double,
            Value::Text(_) => TypeTag::String,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Bytes(_) | Value::Json(_) => TypeTag::Object,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Char(_) => "char",
            Value::Int16(_) => "i16",
            Value::UInt16(_) => "u16",
            Value::Int32(_) => "i32",
            Value::UInt32(_) => "u32",
            Value::Int64(_) => "i64",
            Value::UInt64(_) => "u64",
            Value::Double(_) => "f64",
            Value::Text(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt16(v) => Some(*v as u64),
            Value::UInt32(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            Value::Int16(v) => u64::try_from(*v).ok(),
            Value::Int32(v) => u64::try_from(*v).ok(),
            Value::Int64(v) => u64::try_from(*v).ok(),
            Value::Json(j) => j.as_u64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt16(v) => Some(*v as i64),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            Value::Json(j) => j.as_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            Value::Json(JsonValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Wrap any serializable type as a JSON document value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
        Ok(Value::Json(serde_json::to_value(value)?))
    }

    /// Convert into any deserializable type through the value's JSON form.
    pub fn deserialize_into<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.into_json())?)
    }

    /// JSON form of this value. Dates become RFC 3339 strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Char(c) => JsonValue::String(c.to_string()),
            Value::Int16(v) => JsonValue::from(*v),
            Value::UInt16(v) => JsonValue::from(*v),
            Value::Int32(v) => JsonValue::from(*v),
            Value::UInt32(v) => JsonValue::from(*v),
            Value::Int64(v) => JsonValue::from(*v),
            Value::UInt64(v) => JsonValue::from(*v),
            Value::Double(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::DateTime(dt) => {
                JsonValue::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Bytes(b) => JsonValue::from(b.clone()),
            Value::Json(j) => j.clone(),
        }
    }

    pub fn into_json(self) -> JsonValue {
        match self {
            Value::Json(j) => j,
            Value::Text(s) => JsonValue::String(s),
            other => other.to_json(),
        }
    }

    /// Interpret a decoded JSON tree as the scalar named by `tag`.
    pub fn from_json(json: JsonValue, tag: TypeTag) -> Result<Value, ProtocolError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let value = match tag {
            TypeTag::Empty | TypeTag::Object => Value::Json(json),
            TypeTag::Boolean => Value::Boolean(
                json.as_bool()
                    .ok_or_else(|| invalid_cast(tag, format!("{} is not a boolean", json)))?,
            ),
            TypeTag::Char => {
                let s = json
                    .as_str()
                    .ok_or_else(|| invalid_cast(tag, format!("{} is not a string", json)))?;
                Value::Char(single_char(s)?)
            }
            TypeTag::Int16 => Value::Int16(json_int(&json, tag)?),
            TypeTag::UInt16 => Value::UInt16(json_uint(&json, tag)?),
            TypeTag::Int32 => Value::Int32(json_int(&json, tag)?),
            TypeTag::UInt32 => Value::UInt32(json_uint(&json, tag)?),
            TypeTag::Int64 => Value::Int64(json_int(&json, tag)?),
            TypeTag::UInt64 => Value::UInt64(json_uint(&json, tag)?),
            TypeTag::Double => Value::Double(
                json.as_f64()
                    .ok_or_else(|| invalid_cast(tag, format!("{} is not a number", json)))?,
            ),
            TypeTag::DateTime => {
                let s = json
                    .as_str()
                    .ok_or_else(|| invalid_cast(tag, format!("{} is not a string", json)))?;
                let dt = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| invalid_cast(tag, e.to_string()))?;
                Value::DateTime(dt.with_timezone(&Utc))
            }
            TypeTag::String => match json {
                JsonValue::String(s) => Value::Text(s),
                other => Value::Text(other.to_string()),
            },
        };
        Ok(value)
    }
}

/// A `char` value must decode to exactly one character.
pub(crate) fn single_char(s: &str) -> Result<char, ProtocolError> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(invalid_cast(
            TypeTag::Char,
            format!("expected 1 character, got {}", s.chars().count()),
        )),
    }
}

fn json_int<T: TryFrom<i64>>(json: &JsonValue, tag: TypeTag) -> Result<T, ProtocolError> {
    json.as_i64()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| invalid_cast(tag, format!("{} is out of range", json)))
}

fn json_uint<T: TryFrom<u64>>(json: &JsonValue, tag: TypeTag) -> Result<T, ProtocolError> {
    json.as_u64()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| invalid_cast(tag, format!("{} is out of range", json)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Text(s) => write!(f, "{}", s),
            Value::Char(c) => write!(f, "{}", c),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from_scalar!(
    bool => Boolean,
    char => Char,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Text,
    DateTime<Utc> => DateTime,
    Vec<u8> => Bytes,
    JsonValue => Json,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}
