//! Encode/decode for binary key-value frames.
//!
//! All header integers are big-endian. Every frame is laid out as:
//! `[header: 24 bytes][extras][key][value]`, where the header carries the
//! lengths of each section and `body_length = extras + key + value`.

use bytes::{BufMut, Bytes, BytesMut};

use couch_common::error::ProtocolError;

use crate::types::*;

type Result<T> = std::result::Result<T, ProtocolError>;

/// A request as written to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub opcode: OpCode,
    pub partition: u16,
    pub opaque: u32,
    pub cas: u64,
    pub datatype: u8,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl RequestFrame {
    pub fn new(opcode: OpCode, opaque: u32) -> Self {
        Self {
            opcode,
            partition: 0,
            opaque,
            cas: 0,
            datatype: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }
}

/// A response as read from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub opcode: OpCode,
    pub status: ResponseStatus,
    pub opaque: u32,
    pub cas: u64,
    pub datatype: u8,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl ResponseFrame {
    pub fn new(opcode: OpCode, status: ResponseStatus, opaque: u32) -> Self {
        Self {
            opcode,
            status,
            opaque,
            cas: 0,
            datatype: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }
}

struct Header {
    opcode: OpCode,
    key_length: usize,
    extras_length: usize,
    datatype: u8,
    partition_or_status: u16,
    body_length: usize,
    opaque: u32,
    cas: u64,
}

// ── Helper: read primitives ──────────────────────────────────────────────

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            expected: need,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(arr)
}

fn read_header(input: &[u8], magic: u8) -> Result<Header> {
    ensure(input, HEADER_SIZE)?;
    if input[OFFSET_MAGIC] != magic {
        return Err(ProtocolError::InvalidMagic(input[OFFSET_MAGIC]));
    }
    let opcode = OpCode::from_u8(input[OFFSET_OPCODE])
        .ok_or(ProtocolError::UnknownOpcode(input[OFFSET_OPCODE]))?;
    let body_length = read_u32(input, OFFSET_BODY_LENGTH);
    if body_length > MAX_BODY_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body_length,
            max: MAX_BODY_SIZE,
        });
    }
    let header = Header {
        opcode,
        key_length: read_u16(input, OFFSET_KEY_LENGTH) as usize,
        extras_length: input[OFFSET_EXTRAS_LENGTH] as usize,
        datatype: input[OFFSET_DATATYPE],
        partition_or_status: read_u16(input, OFFSET_PARTITION_OR_STATUS),
        body_length: body_length as usize,
        opaque: read_u32(input, OFFSET_OPAQUE),
        cas: read_u64(input, OFFSET_CAS),
    };
    if header.key_length + header.extras_length > header.body_length {
        return Err(ProtocolError::Truncated {
            expected: header.key_length + header.extras_length,
            actual: header.body_length,
        });
    }
    Ok(header)
}

/// Split the body into (extras, key, value) and report the total frame length.
fn read_body(input: &[u8], header: &Header) -> Result<(Bytes, Bytes, Bytes, usize)> {
    let total = HEADER_SIZE + header.body_length;
    ensure(input, total)?;
    let extras_end = HEADER_SIZE + header.extras_length;
    let key_end = extras_end + header.key_length;
    Ok((
        Bytes::copy_from_slice(&input[HEADER_SIZE..extras_end]),
        Bytes::copy_from_slice(&input[extras_end..key_end]),
        Bytes::copy_from_slice(&input[key_end..total]),
        total,
    ))
}

#[allow(clippy::too_many_arguments)]
fn write_frame(
    out: &mut BytesMut,
    magic: u8,
    opcode: OpCode,
    datatype: u8,
    partition_or_status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) {
    let body_length = extras.len() + key.len() + value.len();
    out.reserve(HEADER_SIZE + body_length);
    out.put_u8(magic);
    out.put_u8(opcode.as_u8());
    out.put_u16(key.len() as u16);
    out.put_u8(extras.len() as u8);
    out.put_u8(datatype);
    out.put_u16(partition_or_status);
    out.put_u32(body_length as u32);
    out.put_u32(opaque);
    out.put_u64(cas);
    out.put_slice(extras);
    out.put_slice(key);
    out.put_slice(value);
}

// ── Public API ───────────────────────────────────────────────────────────

/// Encode a request frame into a new buffer.
pub fn encode_request(frame: &RequestFrame) -> BytesMut {
    let mut out = BytesMut::new();
    write_frame(
        &mut out,
        MAGIC_REQUEST,
        frame.opcode,
        frame.datatype,
        frame.partition,
        frame.opaque,
        frame.cas,
        &frame.extras,
        &frame.key,
        &frame.value,
    );
    out
}

/// Encode a response frame into a new buffer.
pub fn encode_response(frame: &ResponseFrame) -> BytesMut {
    let mut out = BytesMut::new();
    write_frame(
        &mut out,
        MAGIC_RESPONSE,
        frame.opcode,
        frame.datatype,
        frame.status.code(),
        frame.opaque,
        frame.cas,
        &frame.extras,
        &frame.key,
        &frame.value,
    );
    out
}

/// Decode one request frame from `input`.
/// Returns `(frame, bytes_consumed)`.
pub fn decode_request(input: &[u8]) -> Result<(RequestFrame, usize)> {
    let header = read_header(input, MAGIC_REQUEST)?;
    let (extras, key, value, consumed) = read_body(input, &header)?;
    Ok((
        RequestFrame {
            opcode: header.opcode,
            partition: header.partition_or_status,
            opaque: header.opaque,
            cas: header.cas,
            datatype: header.datatype,
            extras,
            key,
            value,
        },
        consumed,
    ))
}

/// Decode one response frame from `input`.
/// Returns `(frame, bytes_consumed)`.
pub fn decode_response(input: &[u8]) -> Result<(ResponseFrame, usize)> {
    let header = read_header(input, MAGIC_RESPONSE)?;
    let (extras, key, value, consumed) = read_body(input, &header)?;
    Ok((
        ResponseFrame {
            opcode: header.opcode,
            status: ResponseStatus::from_u16(header.partition_or_status),
            opaque: header.opaque,
            cas: header.cas,
            datatype: header.datatype,
            extras,
            key,
            value,
        },
        consumed,
    ))
}
