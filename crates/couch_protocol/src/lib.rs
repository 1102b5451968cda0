pub mod codec;
pub mod converter;
pub mod flags;
pub mod transcoder;
pub mod types;
pub mod value;

pub use codec::{decode_request, decode_response, encode_request, encode_response};
pub use codec::{RequestFrame, ResponseFrame};
pub use converter::ByteConverter;
pub use flags::{Compression, DataFormat, Flags, TypeTag};
pub use transcoder::{DefaultSerializer, JsonSerializer, Transcoder};
pub use types::*;
pub use value::Value;
