//! Request executor: resolve → dispatch → classify, with retries.
//!
//! Each attempt takes the current topology snapshot, resolves the target
//! node, encodes the operation with a fresh opaque and waits for the response
//! within the remaining budget. Failed attempts are classified by
//! `RetryDecision`: stale routing re-resolves (publishing any topology
//! document the server sent back), transient failures back off and
//! redispatch, everything else surfaces immediately.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tracing::Instrument;

use couch_cluster::{parse_bucket_config, BucketConfig, ConfigContext, ConfigPublisher, Node, TopologySnapshot};
use couch_common::cancel::CancelSignal;
use couch_common::config::DriverConfig;
use couch_common::error::{CouchError, CouchResult};
use couch_common::types::PartitionId;
use couch_protocol::{
    decode_response, encode_request, Flags, OpCode, ResponseFrame, ResponseStatus, StatusClass,
    Transcoder, Value,
};

use crate::bucket::OperationSender;
use crate::operation::{Operation, OperationKind};
use crate::retry::{RetryDecision, RetryPolicy};

/// Outcome of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub status: ResponseStatus,
    pub value: Value,
    pub cas: u64,
    pub flags: Flags,
    pub opaque: u32,
    /// Dispatch attempts it took, this one included.
    pub attempts: u32,
    /// Address of the node that answered.
    pub node: String,
}

impl OperationResult {
    /// Deserialize the value into `T`.
    pub fn content_as<T: DeserializeOwned>(&self) -> CouchResult<T> {
        Ok(self.value.clone().deserialize_into()?)
    }
}

/// A dispatch that has not completed yet.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub opcode: OpCode,
    pub key: String,
    pub node: String,
    pub dispatched_at: Instant,
}

struct PendingGuard<'a> {
    pending: &'a DashMap<u32, PendingOperation>,
    opaque: u32,
}

impl<'a> PendingGuard<'a> {
    fn register(pending: &'a DashMap<u32, PendingOperation>, opaque: u32, op: PendingOperation) -> Self {
        pending.insert(opaque, op);
        Self { pending, opaque }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.opaque);
    }
}

/// A failed attempt, plus the topology document the server sent back with a
/// not-my-partition response, if any.
struct AttemptFailure {
    error: CouchError,
    topology: Option<BucketConfig>,
}

impl From<CouchError> for AttemptFailure {
    fn from(error: CouchError) -> Self {
        Self {
            error,
            topology: None,
        }
    }
}

pub struct RequestExecutor {
    context: Arc<ConfigContext>,
    transcoder: Arc<Transcoder>,
    publisher: Option<Arc<dyn ConfigPublisher>>,
    policy: RetryPolicy,
    default_timeout: Duration,
    refresh_timeout: Duration,
    /// Correlation id source; one per executor.
    next_opaque: AtomicU32,
    pending: DashMap<u32, PendingOperation>,
}

impl RequestExecutor {
    pub fn new(context: Arc<ConfigContext>, transcoder: Arc<Transcoder>, config: &DriverConfig) -> Self {
        Self {
            context,
            transcoder,
            publisher: None,
            policy: RetryPolicy::from(&config.operation),
            default_timeout: config.operation.timeout(),
            refresh_timeout: config.topology.refresh_timeout(),
            next_opaque: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }

    /// Where topology documents embedded in not-my-partition responses go.
    pub fn with_publisher(mut self, publisher: Arc<dyn ConfigPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn context(&self) -> &Arc<ConfigContext> {
        &self.context
    }

    pub fn transcoder(&self) -> &Arc<Transcoder> {
        &self.transcoder
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// The operation's own timeout, or the configured default.
    pub fn timeout_for(&self, op: &Operation) -> Duration {
        op.explicit_timeout().unwrap_or(self.default_timeout)
    }

    fn next_opaque(&self) -> u32 {
        self.next_opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Operations currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_operations(&self) -> Vec<(u32, PendingOperation)> {
        self.pending
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// One attempt, no retries. The operation's timeout bounds the wait.
    pub async fn send(&self, op: Operation) -> CouchResult<OperationResult> {
        self.send_cancellable(op, &CancelSignal::new()).await
    }

    /// `send`, abandoned as soon as `cancel` fires.
    pub async fn send_cancellable(
        &self,
        mut op: Operation,
        cancel: &CancelSignal,
    ) -> CouchResult<OperationResult> {
        let opcode = op.opcode();
        let started = Instant::now();
        if cancel.is_cancelled() {
            record(opcode, "cancelled", 0, started);
            return Err(CouchError::Cancelled);
        }
        let timeout = self.timeout_for(&op);
        let deadline = started + timeout;
        let span = operation_span(&op);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                record(opcode, "cancelled", 0, started);
                return Err(CouchError::Cancelled);
            }
            outcome = self.attempt(&mut op, timeout, false).instrument(span) => outcome,
        };
        match outcome {
            Ok(mut result) => {
                result.attempts = 1;
                record(opcode, "success", 1, started);
                Ok(result)
            }
            Err(failure) => {
                if let Some(config) = failure.topology {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = self.refresh(config, deadline) => {}
                    }
                }
                record(opcode, outcome_label(&failure.error), 1, started);
                Err(failure.error)
            }
        }
    }

    pub async fn send_with_retry(&self, op: Operation) -> CouchResult<OperationResult> {
        self.send_with_retry_cancellable(op, &CancelSignal::new()).await
    }

    /// Retry until success, a fatal error, the attempt cap, the operation's
    /// deadline, or cancellation.
    pub async fn send_with_retry_cancellable(
        &self,
        op: Operation,
        cancel: &CancelSignal,
    ) -> CouchResult<OperationResult> {
        let span = operation_span(&op);
        self.retry_loop(op, cancel).instrument(span).await
    }

    async fn retry_loop(&self, mut op: Operation, cancel: &CancelSignal) -> CouchResult<OperationResult> {
        let opcode = op.opcode();
        let started = Instant::now();
        let deadline = started + self.timeout_for(&op);
        let mut attempts = 0u32;
        let mut use_forward = false;

        loop {
            if cancel.is_cancelled() {
                record(opcode, "cancelled", attempts, started);
                return Err(CouchError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    record(opcode, "cancelled", attempts - 1, started);
                    return Err(CouchError::Cancelled);
                }
                outcome = self.attempt(&mut op, remaining, use_forward) => outcome,
            };

            let failure = match outcome {
                Ok(mut result) => {
                    result.attempts = attempts;
                    record(opcode, "success", attempts, started);
                    return Ok(result);
                }
                Err(failure) => failure,
            };

            let decision = RetryDecision::classify(&failure.error, op.can_retry());
            if decision == RetryDecision::Fail {
                record(opcode, outcome_label(&failure.error), attempts, started);
                return Err(failure.error);
            }

            use_forward = false;
            if decision == RetryDecision::Refresh {
                match failure.topology {
                    Some(config) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                record(opcode, "cancelled", attempts, started);
                                return Err(CouchError::Cancelled);
                            }
                            _ = self.refresh(config, deadline) => {}
                        }
                    }
                    None => {
                        use_forward = matches!(failure.error, CouchError::NotMyPartition { .. });
                    }
                }
            }

            let error = failure.error;
            let now = Instant::now();
            if now >= deadline {
                record(opcode, "timeout", attempts, started);
                return Err(CouchError::OperationTimeout {
                    attempts,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    last: Box::new(error),
                });
            }
            if attempts >= self.policy.max_attempts {
                record(opcode, "exhausted", attempts, started);
                return Err(CouchError::RetriesExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.bounded_backoff(attempts - 1, deadline - now);
            couch_observability::record_retry(opcode.name(), RetryDecision::reason(&error));
            tracing::warn!(
                opcode = %opcode,
                key = %op.key(),
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying operation"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    record(opcode, "cancelled", attempts, started);
                    return Err(CouchError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Apply a topology document delivered with a not-my-partition response.
    async fn refresh(&self, config: BucketConfig, deadline: Instant) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let rev = config.rev;
        let budget = self
            .refresh_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        match tokio::time::timeout(budget, publisher.publish(config)).await {
            Ok(Ok(change)) => {
                tracing::debug!(rev, change = %change, "topology refreshed from server response");
            }
            Ok(Err(e)) => tracing::warn!(rev, error = %e, "server-supplied topology rejected"),
            Err(_) => tracing::warn!(
                rev,
                timeout_ms = budget.as_millis() as u64,
                "timed out waiting for topology refresh"
            ),
        }
    }

    fn route(
        &self,
        op: &Operation,
        snapshot: &TopologySnapshot,
        use_forward: bool,
    ) -> CouchResult<(Option<PartitionId>, Arc<Node>)> {
        let mapper = snapshot.key_mapper();
        let key = op.key().as_bytes();
        match op.kind() {
            OperationKind::NoOp => snapshot
                .nodes()
                .iter()
                .find(|n| n.is_available())
                .or_else(|| snapshot.nodes().first())
                .cloned()
                .map(|node| (None, node))
                .ok_or_else(|| CouchError::Configuration("topology has no nodes".into())),
            OperationKind::GetReplica { index } => {
                let (partition, node) = mapper.resolve_replica(key, *index)?;
                Ok((Some(partition), node))
            }
            _ => {
                let target = if use_forward {
                    mapper.resolve_forward(key).unwrap_or_else(|| mapper.resolve(key))?
                } else {
                    mapper.resolve(key)?
                };
                Ok((target.partition, target.primary))
            }
        }
    }

    async fn attempt(
        &self,
        op: &mut Operation,
        budget: Duration,
        use_forward: bool,
    ) -> Result<OperationResult, AttemptFailure> {
        let snapshot = self.context.snapshot().ok_or_else(|| {
            CouchError::Configuration(format!(
                "bucket '{}' has no topology loaded",
                self.context.bucket()
            ))
        })?;
        op.mark_revision_tried(snapshot.revision());
        let (partition, node) = self.route(op, &snapshot, use_forward)?;

        let opaque = self.next_opaque();
        let frame = op.to_frame(partition, opaque, &self.transcoder)?;
        let request = encode_request(&frame).freeze();
        let _pending = PendingGuard::register(
            &self.pending,
            opaque,
            PendingOperation {
                opcode: frame.opcode,
                key: op.key().to_string(),
                node: node.address().to_string(),
                dispatched_at: Instant::now(),
            },
        );

        tracing::debug!(
            node = %node.address(),
            opaque,
            partition = frame.partition,
            rev = snapshot.revision().0,
            "dispatching"
        );
        let started = Instant::now();
        let raw = match tokio::time::timeout(budget, node.execute(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CouchError::AttemptTimeout {
                    node: node.address().to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
                .into())
            }
        };

        let (response, _) =
            decode_response(&raw).map_err(|e| CouchError::transport(node.address(), e))?;
        if response.opaque != opaque {
            return Err(CouchError::transport(
                node.address(),
                format!("opaque mismatch: sent {}, received {}", opaque, response.opaque),
            )
            .into());
        }

        match response.status.class() {
            StatusClass::Success => {
                let (value, flags) = op.decode_response(&response, &self.transcoder)?;
                Ok(OperationResult {
                    status: response.status,
                    value,
                    cas: response.cas,
                    flags,
                    opaque,
                    attempts: 0,
                    node: node.address().to_string(),
                })
            }
            StatusClass::NotMyPartition => Err(AttemptFailure {
                error: CouchError::NotMyPartition {
                    node: node.address().to_string(),
                    partition: frame.partition,
                    revision: snapshot.revision().0,
                },
                topology: embedded_topology(&response.value, node.address()),
            }),
            StatusClass::Transient => Err(CouchError::Busy {
                node: node.address().to_string(),
                status: response.status.to_string(),
            }
            .into()),
            StatusClass::Fatal => Err(status_error(&response, frame.partition).into()),
        }
    }
}

fn operation_span(op: &Operation) -> tracing::Span {
    op.span().cloned().unwrap_or_else(|| {
        tracing::debug_span!("couch_operation", opcode = %op.opcode(), bucket = %op.bucket())
    })
}

fn record(opcode: OpCode, outcome: &str, attempts: u32, started: Instant) {
    couch_observability::record_operation_metrics(
        opcode.name(),
        outcome,
        attempts,
        started.elapsed().as_micros() as u64,
    );
}

fn outcome_label(err: &CouchError) -> &'static str {
    match err {
        CouchError::Cancelled => "cancelled",
        CouchError::AttemptTimeout { .. } | CouchError::OperationTimeout { .. } => "timeout",
        e if e.is_fatal() => "fatal",
        _ => "failed",
    }
}

/// Topology document carried in a not-my-partition body. `$HOST` refers to
/// the node that sent it.
fn embedded_topology(body: &[u8], address: &str) -> Option<BucketConfig> {
    if body.is_empty() {
        return None;
    }
    let host = match address.rsplit_once(':') {
        Some((host, _)) => host,
        None => address,
    };
    match parse_bucket_config(body, Some(host)) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(node = %address, error = %e, "ignoring malformed topology in response");
            None
        }
    }
}

fn status_error(response: &ResponseFrame, partition: u16) -> CouchError {
    let message = String::from_utf8_lossy(&response.value).into_owned();
    match response.status {
        ResponseStatus::AuthenticationError | ResponseStatus::AuthStale => {
            CouchError::Authentication(message)
        }
        ResponseStatus::NoReplicasFound => CouchError::NoReplicasFound { partition },
        status => CouchError::Server {
            status: status.to_string(),
            code: status.code(),
            message,
        },
    }
}

#[async_trait]
impl OperationSender for RequestExecutor {
    async fn dispatch(&self, op: Operation, cancel: &CancelSignal) -> CouchResult<OperationResult> {
        self.send_with_retry_cancellable(op, cancel).await
    }

    fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}
