use thiserror::Error;

/// Convenience alias for `Result<T, CouchError>`.
pub type CouchResult<T> = Result<T, CouchError>;

/// Error classification for retry decisions.
///
/// - `Fatal`    : bad input, auth failure, server semantic error; surfaced immediately
/// - `Retryable`: the routing snapshot is stale (not-my-partition, bad node index, node down);
///   the caller re-resolves against a fresh topology and tries again
/// - `Transient`: timeout, transport failure, busy server; the caller MAY retry after back-off
/// - `Cancelled`: the caller withdrew the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fatal,
    Retryable,
    Transient,
    Cancelled,
}

/// Top-level error type returned by every driver crate.
#[derive(Error, Debug)]
pub enum CouchError {
    /// Null or malformed topology document, or an absent/unknown bucket type.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The key mapper resolved a node index outside the bound node list.
    #[error(
        "Topology inconsistency: partition {partition} maps to node index {index} \
         but only {node_count} nodes are known"
    )]
    TopologyInconsistency {
        partition: u16,
        index: i32,
        node_count: usize,
    },

    /// The contacted node no longer owns the key's partition.
    #[error("Not my partition: {node} does not own partition {partition} (rev {revision})")]
    NotMyPartition {
        node: String,
        partition: u16,
        revision: u64,
    },

    #[error("Node unavailable: {node}")]
    NodeUnavailable { node: String },

    #[error("Transport error on {node}: {reason}")]
    Transport { node: String, reason: String },

    /// A single dispatch attempt exceeded its wait budget.
    #[error("Attempt timed out after {elapsed_ms}ms waiting on {node}")]
    AttemptTimeout { node: String, elapsed_ms: u64 },

    /// Busy / temporary-failure response from the server.
    #[error("Server {node} reported {status}")]
    Busy { node: String, status: String },

    /// Semantic error reported by the server (key not found, key exists, ...).
    #[error("Server error {status} (0x{code:04x}): {message}")]
    Server {
        status: String,
        code: u16,
        message: String,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("No replicas found for partition {partition}")]
    NoReplicasFound { partition: u16 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The overall operation deadline passed before any attempt succeeded.
    #[error("Operation timed out after {attempts} attempts ({elapsed_ms}ms): {last}")]
    OperationTimeout {
        attempts: u32,
        elapsed_ms: u64,
        last: Box<CouchError>,
    },

    /// The attempt cap was reached before the deadline.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<CouchError> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire codec and transcoder errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("Invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("Unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("Unknown data format: {0}")]
    UnknownDataFormat(u8),

    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(u8),

    #[error("Invalid UTF-8 in field '{field}': {source}")]
    InvalidUtf8 {
        field: String,
        source: std::string::FromUtf8Error,
    },

    /// The value's type does not fit the requested data format.
    #[error("Type mismatch: {value_type} cannot be encoded as {format}")]
    TypeMismatch { format: String, value_type: String },

    #[error("Unsupported combination: {0}")]
    UnsupportedFormat(String),

    /// A byte buffer cannot be reinterpreted as the requested scalar type.
    #[error("Invalid cast to {target}: {reason}")]
    InvalidCast { target: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CouchError {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CouchError::TopologyInconsistency { .. } => ErrorKind::Retryable,
            CouchError::NotMyPartition { .. } => ErrorKind::Retryable,
            CouchError::NodeUnavailable { .. } => ErrorKind::Retryable,

            CouchError::Transport { .. } => ErrorKind::Transient,
            CouchError::AttemptTimeout { .. } => ErrorKind::Transient,
            CouchError::Busy { .. } => ErrorKind::Transient,
            CouchError::OperationTimeout { .. } => ErrorKind::Transient,
            CouchError::RetriesExhausted { .. } => ErrorKind::Transient,

            CouchError::Cancelled => ErrorKind::Cancelled,

            CouchError::Configuration(_)
            | CouchError::Server { .. }
            | CouchError::Authentication(_)
            | CouchError::InvalidOperation(_)
            | CouchError::NoReplicasFound { .. }
            | CouchError::Protocol(_)
            | CouchError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the routing snapshot was stale and the request never reached
    /// a node that owns the key.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true for timeouts, transport failures and busy responses.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    /// Returns true if the topology should be refreshed before the next attempt.
    pub fn requires_refresh(&self) -> bool {
        matches!(
            self,
            CouchError::NotMyPartition { .. } | CouchError::TopologyInconsistency { .. }
        )
    }

    /// Shorthand for a transport failure on `node`.
    pub fn transport(node: impl Into<String>, reason: impl ToString) -> Self {
        CouchError::Transport {
            node: node.into(),
            reason: reason.to_string(),
        }
    }
}
