//! Key-value operations and their wire encoding.
//!
//! An `Operation` is built once by the caller and may be encoded several
//! times by the retry loop; every encoding gets a fresh opaque and the
//! partition of the node it is routed to.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use couch_common::config::OperationConfig;
use couch_common::error::{CouchError, CouchResult};
use couch_common::types::{PartitionId, Revision};
use couch_protocol::{
    DataFormat, Flags, OpCode, RequestFrame, ResponseFrame, Transcoder, TypeTag, Value,
    COUNTER_EXTRAS_SIZE, GET_EXTRAS_SIZE, MAX_KEY_LENGTH, STORE_EXTRAS_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Create or overwrite.
    Upsert,
    /// Fail if the key exists.
    Insert,
    /// Fail if the key does not exist.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    Increment,
    Decrement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcatMode {
    Append,
    Prepend,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    Get,
    GetReplica { index: usize },
    Store { mode: StoreMode, value: Value },
    Delete,
    Counter { mode: CounterMode, delta: u64, initial: u64 },
    Concat { mode: ConcatMode, value: Value },
    NoOp,
}

#[derive(Debug, Clone)]
pub struct Operation {
    kind: OperationKind,
    key: String,
    bucket: String,
    cas: u64,
    /// Document TTL in seconds; 0 never expires.
    expires: u32,
    /// Wait bound for the whole call, retries included. `None` takes the
    /// executor's configured default.
    timeout: Option<Duration>,
    flags: Option<Flags>,
    span: Option<tracing::Span>,
    last_config_revision_tried: Option<Revision>,
}

fn default_timeout() -> Duration {
    OperationConfig::default().timeout()
}

impl Operation {
    fn new(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            bucket: String::new(),
            cas: 0,
            expires: 0,
            timeout: None,
            flags: None,
            span: None,
            last_config_revision_tried: None,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Get, key)
    }

    pub fn get_replica(key: impl Into<String>, index: usize) -> Self {
        Self::new(OperationKind::GetReplica { index }, key)
    }

    pub fn store(mode: StoreMode, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            OperationKind::Store {
                mode,
                value: value.into(),
            },
            key,
        )
    }

    pub fn upsert(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::store(StoreMode::Upsert, key, value)
    }

    pub fn insert(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::store(StoreMode::Insert, key, value)
    }

    pub fn replace(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::store(StoreMode::Replace, key, value)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, key)
    }

    pub fn increment(key: impl Into<String>) -> Self {
        Self::counter(CounterMode::Increment, key)
    }

    pub fn decrement(key: impl Into<String>) -> Self {
        Self::counter(CounterMode::Decrement, key)
    }

    fn counter(mode: CounterMode, key: impl Into<String>) -> Self {
        Self::new(
            OperationKind::Counter {
                mode,
                delta: 1,
                initial: 1,
            },
            key,
        )
    }

    pub fn append(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            OperationKind::Concat {
                mode: ConcatMode::Append,
                value: value.into(),
            },
            key,
        )
    }

    pub fn prepend(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(
            OperationKind::Concat {
                mode: ConcatMode::Prepend,
                value: value.into(),
            },
            key,
        )
    }

    pub fn noop() -> Self {
        Self::new(OperationKind::NoOp, "")
    }

    // ── Builder setters ──────────────────────────────────────────────────

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Correlation span from an external tracer; dispatch runs inside it.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Counter step. Ignored by non-counter operations.
    pub fn with_delta(mut self, value: u64) -> Self {
        if let OperationKind::Counter { delta, .. } = &mut self.kind {
            *delta = value;
        }
        self
    }

    /// Seed stored when the counter does not exist. Ignored by non-counter
    /// operations.
    pub fn with_initial(mut self, value: u64) -> Self {
        if let OperationKind::Counter { initial, .. } = &mut self.kind {
            *initial = value;
        }
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn expires(&self) -> u32 {
        self.expires
    }

    /// Effective timeout, falling back to the built-in driver default.
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(default_timeout)
    }

    /// Timeout set on this operation, if any.
    pub fn explicit_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn flags(&self) -> Option<Flags> {
        self.flags
    }

    pub fn span(&self) -> Option<&tracing::Span> {
        self.span.as_ref()
    }

    pub fn delta(&self) -> Option<u64> {
        match self.kind {
            OperationKind::Counter { delta, .. } => Some(delta),
            _ => None,
        }
    }

    pub fn initial(&self) -> Option<u64> {
        match self.kind {
            OperationKind::Counter { initial, .. } => Some(initial),
            _ => None,
        }
    }

    pub fn last_config_revision_tried(&self) -> Option<Revision> {
        self.last_config_revision_tried
    }

    pub(crate) fn mark_revision_tried(&mut self, revision: Revision) {
        self.last_config_revision_tried = Some(revision);
    }

    pub fn opcode(&self) -> OpCode {
        match &self.kind {
            OperationKind::Get => OpCode::Get,
            OperationKind::GetReplica { .. } => OpCode::GetReplica,
            OperationKind::Store { mode, .. } => match mode {
                StoreMode::Upsert => OpCode::Set,
                StoreMode::Insert => OpCode::Add,
                StoreMode::Replace => OpCode::Replace,
            },
            OperationKind::Delete => OpCode::Delete,
            OperationKind::Counter { mode, .. } => match mode {
                CounterMode::Increment => OpCode::Increment,
                CounterMode::Decrement => OpCode::Decrement,
            },
            OperationKind::Concat { mode, .. } => match mode {
                ConcatMode::Append => OpCode::Append,
                ConcatMode::Prepend => OpCode::Prepend,
            },
            OperationKind::NoOp => OpCode::NoOp,
        }
    }

    pub fn is_keyed(&self) -> bool {
        !matches!(self.kind, OperationKind::NoOp)
    }

    /// Whether the operation may be sent again after a dispatch whose outcome
    /// is unknown. Reads always can; mutations only when guarded by a CAS.
    pub fn can_retry(&self) -> bool {
        match self.kind {
            OperationKind::Get | OperationKind::GetReplica { .. } | OperationKind::NoOp => true,
            _ => self.cas > 0,
        }
    }

    fn validate_key(&self) -> CouchResult<()> {
        if !self.is_keyed() {
            return Ok(());
        }
        if self.key.is_empty() {
            return Err(CouchError::InvalidOperation(format!(
                "{} requires a key",
                self.opcode()
            )));
        }
        if self.key.len() > MAX_KEY_LENGTH {
            return Err(CouchError::InvalidOperation(format!(
                "key of {} bytes exceeds the {} byte limit",
                self.key.len(),
                MAX_KEY_LENGTH
            )));
        }
        Ok(())
    }

    /// Encode as a request for `partition` tagged with `opaque`.
    pub fn to_frame(
        &self,
        partition: Option<PartitionId>,
        opaque: u32,
        transcoder: &Transcoder,
    ) -> CouchResult<RequestFrame> {
        self.validate_key()?;
        let opcode = self.opcode();
        let mut frame = RequestFrame::new(opcode, opaque);
        frame.partition = partition.map(|p| p.0).unwrap_or(0);
        frame.cas = self.cas;
        frame.key = Bytes::copy_from_slice(self.key.as_bytes());

        match &self.kind {
            OperationKind::Store { value, .. } => {
                let flags = self.flags.unwrap_or_else(|| transcoder.get_format(value));
                let mut extras = BytesMut::with_capacity(STORE_EXTRAS_SIZE);
                extras.put_u32(flags.to_u32());
                extras.put_u32(self.expires);
                frame.extras = extras.freeze();
                frame.value = transcoder.encode(value, flags, opcode)?;
            }
            OperationKind::Counter { delta, initial, .. } => {
                let mut extras = BytesMut::with_capacity(COUNTER_EXTRAS_SIZE);
                extras.put_u64(*delta);
                extras.put_u64(*initial);
                extras.put_u32(self.expires);
                frame.extras = extras.freeze();
            }
            OperationKind::Concat { value, .. } => {
                let flags = self.flags.unwrap_or_else(|| transcoder.get_format(value));
                frame.value = transcoder.encode(value, flags, opcode)?;
            }
            OperationKind::Get
            | OperationKind::GetReplica { .. }
            | OperationKind::Delete
            | OperationKind::NoOp => {}
        }
        Ok(frame)
    }

    /// Decode the value carried by a successful response.
    pub fn decode_response(
        &self,
        response: &ResponseFrame,
        transcoder: &Transcoder,
    ) -> CouchResult<(Value, Flags)> {
        match &self.kind {
            OperationKind::Get | OperationKind::GetReplica { .. } => {
                let flags = if response.extras.len() >= GET_EXTRAS_SIZE {
                    let raw = transcoder.converter().to_u32(&response.extras[..GET_EXTRAS_SIZE], true)?;
                    Flags::from_u32(raw)?
                } else {
                    Flags::default()
                };
                let value = transcoder.decode(&response.value, flags, response.opcode)?;
                Ok((value, flags))
            }
            OperationKind::Counter { .. } => {
                let flags = Flags::new(DataFormat::Reserved, TypeTag::UInt64);
                let value = transcoder.decode(&response.value, flags, response.opcode)?;
                Ok((value, flags))
            }
            _ => Ok((Value::Null, Flags::default())),
        }
    }
}
