//! Retry classification and backoff for the request executor.

use std::time::Duration;

use couch_common::config::OperationConfig;
use couch_common::error::{CouchError, ErrorKind};

/// What the retry loop does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Routing is stale: refresh topology if a document is at hand, then
    /// re-resolve and redispatch.
    Refresh,
    /// Back off and redispatch.
    Retry,
    /// Surface the error to the caller.
    Fail,
}

impl RetryDecision {
    /// Classify `err`. `can_retry` is the operation's answer to whether it
    /// may be sent again after a dispatch with unknown outcome.
    pub fn classify(err: &CouchError, can_retry: bool) -> Self {
        match err.kind() {
            ErrorKind::Fatal | ErrorKind::Cancelled => Self::Fail,
            ErrorKind::Retryable if err.requires_refresh() => Self::Refresh,
            ErrorKind::Retryable => Self::Retry,
            ErrorKind::Transient => match err {
                // The server refused the request, nothing was applied.
                CouchError::Busy { .. } => Self::Retry,
                _ if can_retry => Self::Retry,
                _ => Self::Fail,
            },
        }
    }

    /// Metric label for the reason of a retry.
    pub fn reason(err: &CouchError) -> &'static str {
        match err {
            CouchError::NotMyPartition { .. } => "not_my_partition",
            CouchError::TopologyInconsistency { .. } => "topology_inconsistency",
            CouchError::NodeUnavailable { .. } => "node_unavailable",
            CouchError::Busy { .. } => "busy",
            CouchError::AttemptTimeout { .. } => "attempt_timeout",
            CouchError::Transport { .. } => "transport",
            _ => "other",
        }
    }
}

/// Attempt cap and exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff multiplier (2 doubles every attempt).
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&OperationConfig::default())
    }
}

impl From<&OperationConfig> for RetryPolicy {
    fn from(cfg: &OperationConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff: cfg.initial_backoff(),
            max_backoff: cfg.max_backoff(),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (0-indexed), capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry.min(31));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retry `retry`, never past `remaining` budget.
    pub fn bounded_backoff(&self, retry: u32, remaining: Duration) -> Duration {
        self.backoff_for_attempt(retry).min(remaining)
    }
}
