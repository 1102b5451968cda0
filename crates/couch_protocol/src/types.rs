//! Binary protocol constants, opcodes and response statuses.

use std::fmt;

/// Every frame starts with a fixed 24-byte header.
pub const HEADER_SIZE: usize = 24;

/// Largest body accepted from the wire: 20 MiB.
pub const MAX_BODY_SIZE: u32 = 20 * 1024 * 1024;

/// Longest key the server accepts.
pub const MAX_KEY_LENGTH: usize = 250;

// ── Magic bytes ──────────────────────────────────────────────────────────

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

// ── Header offsets ───────────────────────────────────────────────────────

pub const OFFSET_MAGIC: usize = 0;
pub const OFFSET_OPCODE: usize = 1;
pub const OFFSET_KEY_LENGTH: usize = 2;
pub const OFFSET_EXTRAS_LENGTH: usize = 4;
pub const OFFSET_DATATYPE: usize = 5;
/// Partition id in requests, status in responses.
pub const OFFSET_PARTITION_OR_STATUS: usize = 6;
pub const OFFSET_BODY_LENGTH: usize = 8;
pub const OFFSET_OPAQUE: usize = 12;
pub const OFFSET_CAS: usize = 16;

// ── Extras sizes ─────────────────────────────────────────────────────────

/// flags u32 + expiration u32.
pub const STORE_EXTRAS_SIZE: usize = 8;
/// delta u64 + initial u64 + expiration u32.
pub const COUNTER_EXTRAS_SIZE: usize = 20;
/// flags u32 returned with a document read.
pub const GET_EXTRAS_SIZE: usize = 4;

/// Opcodes used by the driver core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    NoOp = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    SaslAuth = 0x21,
    GetReplica = 0x83,
    GetClusterConfig = 0xb5,
}

impl OpCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Get),
            0x01 => Some(Self::Set),
            0x02 => Some(Self::Add),
            0x03 => Some(Self::Replace),
            0x04 => Some(Self::Delete),
            0x05 => Some(Self::Increment),
            0x06 => Some(Self::Decrement),
            0x0a => Some(Self::NoOp),
            0x0e => Some(Self::Append),
            0x0f => Some(Self::Prepend),
            0x21 => Some(Self::SaslAuth),
            0x83 => Some(Self::GetReplica),
            0xb5 => Some(Self::GetClusterConfig),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Increment and decrement carry their 8-byte counter big-endian.
    pub fn is_counter(self) -> bool {
        matches!(self, OpCode::Increment | OpCode::Decrement)
    }

    /// Operations that change the document on the server.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            OpCode::Set
                | OpCode::Add
                | OpCode::Replace
                | OpCode::Delete
                | OpCode::Increment
                | OpCode::Decrement
                | OpCode::Append
                | OpCode::Prepend
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Get => "get",
            OpCode::Set => "set",
            OpCode::Add => "add",
            OpCode::Replace => "replace",
            OpCode::Delete => "delete",
            OpCode::Increment => "increment",
            OpCode::Decrement => "decrement",
            OpCode::NoOp => "noop",
            OpCode::Append => "append",
            OpCode::Prepend => "prepend",
            OpCode::SaslAuth => "sasl_auth",
            OpCode::GetReplica => "get_replica",
            OpCode::GetClusterConfig => "get_cluster_config",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the retry loop should treat a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// The node does not own the partition; refresh and re-resolve.
    NotMyPartition,
    /// Busy, temporary failure, client-side transport trouble.
    Transient,
    /// Semantic or authentication failure; never retried.
    Fatal,
}

/// Response status. Server codes plus the client-side codes the driver assigns
/// when no server response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    IncrDecrOnNonNumericValue,
    VBucketBelongsToAnotherServer,
    AuthStale,
    AuthenticationError,
    AuthenticationContinue,
    InvalidRange,
    Locked,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    ClientFailure,
    OperationTimeout,
    NoReplicasFound,
    NodeUnavailable,
    TransportFailure,
    Unknown(u16),
}

impl ResponseStatus {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Self::Success,
            0x0001 => Self::KeyNotFound,
            0x0002 => Self::KeyExists,
            0x0003 => Self::ValueTooLarge,
            0x0004 => Self::InvalidArguments,
            0x0005 => Self::ItemNotStored,
            0x0006 => Self::IncrDecrOnNonNumericValue,
            0x0007 => Self::VBucketBelongsToAnotherServer,
            0x001f => Self::AuthStale,
            0x0020 => Self::AuthenticationError,
            0x0021 => Self::AuthenticationContinue,
            0x0022 => Self::InvalidRange,
            0x0009 => Self::Locked,
            0x0081 => Self::UnknownCommand,
            0x0082 => Self::OutOfMemory,
            0x0083 => Self::NotSupported,
            0x0084 => Self::InternalError,
            0x0085 => Self::Busy,
            0x0086 => Self::TemporaryFailure,
            0x0199 => Self::ClientFailure,
            0x0200 => Self::OperationTimeout,
            0x0300 => Self::NoReplicasFound,
            0x0400 => Self::NodeUnavailable,
            0x0500 => Self::TransportFailure,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Success => 0x0000,
            Self::KeyNotFound => 0x0001,
            Self::KeyExists => 0x0002,
            Self::ValueTooLarge => 0x0003,
            Self::InvalidArguments => 0x0004,
            Self::ItemNotStored => 0x0005,
            Self::IncrDecrOnNonNumericValue => 0x0006,
            Self::VBucketBelongsToAnotherServer => 0x0007,
            Self::AuthStale => 0x001f,
            Self::AuthenticationError => 0x0020,
            Self::AuthenticationContinue => 0x0021,
            Self::InvalidRange => 0x0022,
            Self::Locked => 0x0009,
            Self::UnknownCommand => 0x0081,
            Self::OutOfMemory => 0x0082,
            Self::NotSupported => 0x0083,
            Self::InternalError => 0x0084,
            Self::Busy => 0x0085,
            Self::TemporaryFailure => 0x0086,
            Self::ClientFailure => 0x0199,
            Self::OperationTimeout => 0x0200,
            Self::NoReplicasFound => 0x0300,
            Self::NodeUnavailable => 0x0400,
            Self::TransportFailure => 0x0500,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn class(self) -> StatusClass {
        match self {
            Self::Success => StatusClass::Success,
            Self::VBucketBelongsToAnotherServer => StatusClass::NotMyPartition,
            Self::Busy
            | Self::TemporaryFailure
            | Self::OutOfMemory
            | Self::ClientFailure
            | Self::OperationTimeout
            | Self::NodeUnavailable
            | Self::TransportFailure => StatusClass::Transient,
            _ => StatusClass::Fatal,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown(0x{:04x})", code),
            other => write!(f, "{:?}", other),
        }
    }
}
