//! Bucket facade over an operation sender.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use couch_common::cancel::CancelSignal;
use couch_common::error::{CouchError, CouchResult};
use couch_protocol::Value;

use crate::executor::OperationResult;
use crate::operation::Operation;

/// Sends fully-built operations. Implemented by `RequestExecutor`.
#[async_trait]
pub trait OperationSender: Send + Sync {
    async fn dispatch(&self, op: Operation, cancel: &CancelSignal) -> CouchResult<OperationResult>;

    /// Timeout applied to operations that do not set one.
    fn default_timeout(&self) -> Duration;
}

/// Optional counter parameters. Unset fields keep their defaults
/// (`delta = 1`, `initial = 1`, `expires = 0`, driver default timeout).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementOptions {
    pub delta: Option<u64>,
    pub initial: Option<u64>,
    pub expires: Option<u32>,
    pub timeout: Option<Duration>,
}

impl IncrementOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delta(mut self, delta: u64) -> Self {
        self.delta = Some(delta);
        self
    }

    pub fn initial(mut self, initial: u64) -> Self {
        self.initial = Some(initial);
        self
    }

    pub fn expires(mut self, expires: u32) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn apply(&self, mut op: Operation) -> Operation {
        if let Some(delta) = self.delta {
            op = op.with_delta(delta);
        }
        if let Some(initial) = self.initial {
            op = op.with_initial(initial);
        }
        if let Some(expires) = self.expires {
            op = op.with_expires(expires);
        }
        if let Some(timeout) = self.timeout {
            op = op.with_timeout(timeout);
        }
        op
    }
}

/// Decrement takes the same parameters as increment.
pub type DecrementOptions = IncrementOptions;

pub struct Bucket<S: OperationSender> {
    name: String,
    sender: Arc<S>,
    /// Fired by `close`; shared with every scoped view.
    closed: CancelSignal,
    /// Per-call signal of a view made by `with_cancel`.
    scope: Option<CancelSignal>,
}

impl<S: OperationSender> Bucket<S> {
    pub fn new(name: impl Into<String>, sender: Arc<S>) -> Self {
        Self {
            name: name.into(),
            sender,
            closed: CancelSignal::new(),
            scope: None,
        }
    }

    /// A view of this bucket whose operations also stop when `cancel` fires.
    /// Closing either the view or the bucket closes both.
    pub fn with_cancel(&self, cancel: &CancelSignal) -> Bucket<S> {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            closed: self.closed.clone(),
            scope: Some(cancel.clone()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> &Arc<S> {
        &self.sender
    }

    /// Cancel every operation issued through this bucket that is still
    /// running, and every later one.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn prepare(&self, op: Operation) -> Operation {
        op.with_bucket(self.name.clone())
            .with_timeout(self.sender.default_timeout())
    }

    async fn run(&self, op: Operation) -> CouchResult<OperationResult> {
        let Some(scope) = &self.scope else {
            return self.sender.dispatch(op, &self.closed).await;
        };
        if scope.is_cancelled() {
            return Err(CouchError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(CouchError::Cancelled),
            result = self.sender.dispatch(op, scope) => result,
        }
    }

    pub async fn get(&self, key: &str) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::get(key))).await
    }

    /// Read from replica slot `index` (0-based).
    pub async fn get_replica(&self, key: &str, index: usize) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::get_replica(key, index))).await
    }

    pub async fn upsert(&self, key: &str, value: impl Into<Value>) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::upsert(key, value))).await
    }

    pub async fn insert(&self, key: &str, value: impl Into<Value>) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::insert(key, value))).await
    }

    /// Replace an existing document. A non-zero `cas` makes the write
    /// conditional on the document not having changed.
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Value>,
        cas: u64,
    ) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::replace(key, value)).with_cas(cas))
            .await
    }

    pub async fn remove(&self, key: &str, cas: u64) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::delete(key)).with_cas(cas)).await
    }

    pub async fn increment(&self, key: &str) -> CouchResult<OperationResult> {
        self.increment_with(key, IncrementOptions::default()).await
    }

    pub async fn increment_with(
        &self,
        key: &str,
        options: IncrementOptions,
    ) -> CouchResult<OperationResult> {
        let op = options.apply(self.prepare(Operation::increment(key)));
        self.run(op).await
    }

    pub async fn decrement(&self, key: &str) -> CouchResult<OperationResult> {
        self.decrement_with(key, DecrementOptions::default()).await
    }

    pub async fn decrement_with(
        &self,
        key: &str,
        options: DecrementOptions,
    ) -> CouchResult<OperationResult> {
        let op = options.apply(self.prepare(Operation::decrement(key)));
        self.run(op).await
    }

    pub async fn append(&self, key: &str, value: impl Into<Value>) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::append(key, value))).await
    }

    pub async fn prepend(&self, key: &str, value: impl Into<Value>) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::prepend(key, value))).await
    }

    /// NoOp round trip to any available node.
    pub async fn ping(&self) -> CouchResult<OperationResult> {
        self.run(self.prepare(Operation::noop())).await
    }
}
