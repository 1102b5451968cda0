//! Cluster nodes and the connection collaborators they are built from.
//!
//! Socket I/O, pooling policy and the SASL handshake live behind the traits
//! in this module; the driver core only ever sees a `Node` that can exchange
//! one request frame for one response frame.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use couch_common::config::NodeHealthConfig;
use couch_common::error::{CouchError, CouchResult};
use couch_protocol::{decode_response, encode_request, OpCode, RequestFrame};

use crate::circuit_breaker::{BreakerConfig, BreakerState, NodeCircuitBreaker};

/// One established transport to a node.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn write(&self, bytes: Bytes) -> CouchResult<()>;

    /// Read one complete response frame.
    async fn read_response(&self) -> CouchResult<Bytes>;

    fn local_endpoint(&self) -> String;

    fn remote_endpoint(&self) -> String;
}

/// Hands out connections to a single node. Whether connections are shared
/// between in-flight operations is the pool's decision.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self) -> CouchResult<Arc<dyn Connection>>;

    async fn release(&self, _conn: Arc<dyn Connection>) {}

    async fn close(&self);
}

/// Opens a pool for a node address.
#[async_trait]
pub trait PoolFactory: Send + Sync {
    async fn create_pool(&self, address: &str) -> CouchResult<Arc<dyn ConnectionPool>>;
}

/// SASL-style authentication, performed once per node at construction.
#[async_trait]
pub trait SaslMechanism: Send + Sync {
    fn mechanism(&self) -> &str;

    async fn authenticate(
        &self,
        conn: &dyn Connection,
        bucket: &str,
        password: &str,
    ) -> CouchResult<()>;
}

/// A key-value node: its address, its connection pool and its health.
pub struct Node {
    address: String,
    pool: Option<Arc<dyn ConnectionPool>>,
    breaker: NodeCircuitBreaker,
    retired: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    /// Woken when a retired node's last dispatch finishes.
    drained: Notify,
    /// Set when the SASL handshake was rejected. Returned by every dispatch.
    auth_failure: Option<String>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("connected", &self.pool.is_some())
            .field("breaker", &self.breaker.state())
            .field("retired", &self.is_retired())
            .field("auth_failed", &self.auth_failure.is_some())
            .finish()
    }
}

/// Tracks one dispatch. A dispatch that is dropped before it completes
/// (timeout, cancellation) counts as a failure.
pub(crate) struct DispatchGuard<'a> {
    node: &'a Node,
    completed: bool,
}

impl<'a> DispatchGuard<'a> {
    pub(crate) fn new(node: &'a Node) -> Self {
        node.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            node,
            completed: false,
        }
    }

    fn finish(mut self, ok: bool) {
        self.completed = true;
        if ok {
            self.node.breaker.record_success();
        } else {
            self.node.breaker.record_failure();
        }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.node.breaker.record_failure();
        }
        let previous = self.node.in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.node.is_retired() {
            self.node.drained.notify_one();
        }
    }
}

impl Node {
    pub fn new(
        address: impl Into<String>,
        pool: Arc<dyn ConnectionPool>,
        config: BreakerConfig,
    ) -> Self {
        let address = address.into();
        Self {
            breaker: NodeCircuitBreaker::new(address.clone(), config),
            address,
            pool: Some(pool),
            retired: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Notify::new(),
            auth_failure: None,
        }
    }

    /// A node whose connection could not be established. Dispatch fails fast.
    pub fn unavailable(address: impl Into<String>, config: BreakerConfig) -> Self {
        let address = address.into();
        Self {
            breaker: NodeCircuitBreaker::tripped(address.clone(), config),
            address,
            pool: None,
            retired: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Notify::new(),
            auth_failure: None,
        }
    }

    /// A node that rejected the bucket credentials. Dispatch fails with
    /// `Authentication`, which is never retried.
    pub fn auth_failed(
        address: impl Into<String>,
        config: BreakerConfig,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            auth_failure: Some(reason.into()),
            ..Self::unavailable(address, config)
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_some()
    }

    pub fn is_available(&self) -> bool {
        self.pool.is_some() && !self.is_retired() && self.breaker.state() != BreakerState::Open
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_auth_failed(&self) -> bool {
        self.auth_failure.is_some()
    }

    pub fn breaker(&self) -> &NodeCircuitBreaker {
        &self.breaker
    }

    /// Evicted by a topology swap: no new dispatches are accepted.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Resolves once no dispatch is in flight. Meant for retired nodes.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn unavailable_error(&self) -> CouchError {
        CouchError::NodeUnavailable {
            node: self.address.clone(),
        }
    }

    /// Write one request frame and read its response frame.
    pub async fn execute(&self, frame: Bytes) -> CouchResult<Bytes> {
        if let Some(reason) = &self.auth_failure {
            return Err(CouchError::Authentication(reason.clone()));
        }
        if self.is_retired() {
            return Err(self.unavailable_error());
        }
        let pool = self.pool.as_ref().ok_or_else(|| self.unavailable_error())?;
        self.breaker.check()?;

        let guard = DispatchGuard::new(self);
        let result = async {
            let conn = pool.acquire().await?;
            let exchange = async {
                conn.write(frame).await?;
                conn.read_response().await
            }
            .await;
            pool.release(conn).await;
            exchange
        }
        .await;

        let transport_ok = match &result {
            Ok(_) => true,
            Err(e) => !e.is_transient(),
        };
        guard.finish(transport_ok);
        result
    }

    /// Liveness check: a NoOp round trip.
    pub async fn probe(&self, opaque: u32) -> CouchResult<()> {
        let request = encode_request(&RequestFrame::new(OpCode::NoOp, opaque)).freeze();
        let raw = self.execute(request).await?;
        let (response, _) = decode_response(&raw)?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(CouchError::Busy {
                node: self.address.clone(),
                status: response.status.to_string(),
            })
        }
    }

    pub(crate) async fn dispose(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        tracing::debug!(node = %self.address, "node disposed");
    }
}

/// Builds `Node`s: opens a pool and authenticates it. A node that cannot be
/// reached is returned in the unavailable state instead of failing the caller.
pub struct NodeConnector {
    factory: Arc<dyn PoolFactory>,
    sasl: Option<Arc<dyn SaslMechanism>>,
    bucket: String,
    password: String,
    breaker: BreakerConfig,
}

impl NodeConnector {
    pub fn new(factory: Arc<dyn PoolFactory>, bucket: impl Into<String>) -> Self {
        Self {
            factory,
            sasl: None,
            bucket: bucket.into(),
            password: String::new(),
            breaker: BreakerConfig::default(),
        }
    }

    pub fn with_sasl(mut self, sasl: Arc<dyn SaslMechanism>, password: impl Into<String>) -> Self {
        self.sasl = Some(sasl);
        self.password = password.into();
        self
    }

    pub fn with_health(mut self, health: &NodeHealthConfig) -> Self {
        self.breaker = BreakerConfig::from(health);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub async fn connect(&self, address: &str) -> Arc<Node> {
        match self.try_connect(address).await {
            Ok(pool) => {
                tracing::info!(node = %address, bucket = %self.bucket, "node connected");
                Arc::new(Node::new(address, pool, self.breaker.clone()))
            }
            Err(CouchError::Authentication(reason)) => {
                tracing::warn!(
                    node = %address,
                    bucket = %self.bucket,
                    reason = %reason,
                    "bucket credentials rejected"
                );
                metrics::counter!("couch_node_auth_failures_total").increment(1);
                Arc::new(Node::auth_failed(address, self.breaker.clone(), reason))
            }
            Err(e) => {
                tracing::warn!(
                    node = %address,
                    bucket = %self.bucket,
                    error = %e,
                    "node unreachable, marking unavailable"
                );
                metrics::counter!("couch_node_connect_failures_total").increment(1);
                Arc::new(Node::unavailable(address, self.breaker.clone()))
            }
        }
    }

    async fn try_connect(&self, address: &str) -> CouchResult<Arc<dyn ConnectionPool>> {
        let pool = self.factory.create_pool(address).await?;
        if let Some(sasl) = &self.sasl {
            let auth = async {
                let conn = pool.acquire().await?;
                let result = sasl.authenticate(conn.as_ref(), &self.bucket, &self.password).await;
                pool.release(conn).await;
                result
            }
            .await;
            if let Err(e) = auth {
                pool.close().await;
                return Err(e);
            }
            tracing::debug!(node = %address, mechanism = sasl.mechanism(), "authenticated");
        }
        Ok(pool)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use couch_protocol::{encode_response, ResponseFrame, ResponseStatus};
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::AtomicU32;

    /// Loopback connection answering every request with `status`.
    pub(crate) struct EchoConnection {
        status: ResponseStatus,
        pending: Mutex<VecDeque<Bytes>>,
        fail_writes: bool,
    }

    #[async_trait]
    impl Connection for EchoConnection {
        async fn write(&self, bytes: Bytes) -> CouchResult<()> {
            if self.fail_writes {
                return Err(CouchError::transport("test", "broken pipe"));
            }
            let (req, _) = couch_protocol::decode_request(&bytes)?;
            let resp = ResponseFrame::new(req.opcode, self.status, req.opaque);
            self.pending.lock().push_back(encode_response(&resp).freeze());
            Ok(())
        }

        async fn read_response(&self) -> CouchResult<Bytes> {
            self.pending
                .lock()
                .pop_front()
                .ok_or_else(|| CouchError::transport("test", "nothing to read"))
        }

        fn local_endpoint(&self) -> String {
            "127.0.0.1:50000".into()
        }

        fn remote_endpoint(&self) -> String {
            "127.0.0.1:11210".into()
        }
    }

    pub(crate) struct EchoPool {
        conn: Arc<EchoConnection>,
        pub(crate) closed: AtomicBool,
    }

    #[async_trait]
    impl ConnectionPool for EchoPool {
        async fn acquire(&self) -> CouchResult<Arc<dyn Connection>> {
            Ok(self.conn.clone())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Pool factory that refuses addresses in `unreachable`.
    #[derive(Default)]
    pub(crate) struct TestFactory {
        pub(crate) unreachable: Mutex<HashSet<String>>,
        pub(crate) created: AtomicU32,
        pub(crate) pools: Mutex<Vec<(String, Arc<EchoPool>)>>,
    }

    #[async_trait]
    impl PoolFactory for TestFactory {
        async fn create_pool(&self, address: &str) -> CouchResult<Arc<dyn ConnectionPool>> {
            if self.unreachable.lock().contains(address) {
                return Err(CouchError::transport(address, "connection refused"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            let pool = echo_pool(ResponseStatus::Success, false);
            self.pools.lock().push((address.to_string(), pool.clone()));
            Ok(pool)
        }
    }

    pub(crate) fn echo_pool(status: ResponseStatus, fail_writes: bool) -> Arc<EchoPool> {
        Arc::new(EchoPool {
            conn: Arc::new(EchoConnection {
                status,
                pending: Mutex::new(VecDeque::new()),
                fail_writes,
            }),
            closed: AtomicBool::new(false),
        })
    }

    struct RejectingSasl;

    #[async_trait]
    impl SaslMechanism for RejectingSasl {
        fn mechanism(&self) -> &str {
            "PLAIN"
        }

        async fn authenticate(&self, _: &dyn Connection, bucket: &str, _: &str) -> CouchResult<()> {
            Err(CouchError::Authentication(format!("bucket {bucket} rejected")))
        }
    }

    #[tokio::test]
    async fn test_probe_succeeds_on_live_node() {
        let node = Node::new("n1:11210", echo_pool(ResponseStatus::Success, false), BreakerConfig::default());
        node.probe(1).await.unwrap();
        assert_eq!(node.in_flight(), 0);
        assert_eq!(node.breaker().metrics().total_successes, 1);
    }

    #[tokio::test]
    async fn test_transport_failures_open_breaker() {
        let config = BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        };
        let node = Node::new("n1:11210", echo_pool(ResponseStatus::Success, true), config);
        for _ in 0..2 {
            let err = node.probe(1).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(!node.is_available());
        let err = node.probe(1).await.unwrap_err();
        assert!(matches!(err, CouchError::NodeUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_node_fails_fast() {
        let node = Node::unavailable("n2:11210", BreakerConfig::default());
        assert!(!node.is_connected());
        let err = node.probe(1).await.unwrap_err();
        assert!(matches!(err, CouchError::NodeUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_retired_node_rejects_dispatch() {
        let node = Node::new("n1:11210", echo_pool(ResponseStatus::Success, false), BreakerConfig::default());
        node.retire();
        assert!(matches!(
            node.probe(1).await.unwrap_err(),
            CouchError::NodeUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_drained_wakes_on_last_dispatch() {
        let node = Arc::new(Node::new(
            "n1:11210",
            echo_pool(ResponseStatus::Success, false),
            BreakerConfig::default(),
        ));
        let guard = DispatchGuard::new(&node);
        node.retire();

        let waiter = {
            let node = node.clone();
            tokio::spawn(async move { node.wait_drained().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_connector_marks_unreachable_node_unavailable() {
        let factory = Arc::new(TestFactory::default());
        factory.unreachable.lock().insert("down:11210".into());
        let connector = NodeConnector::new(factory.clone(), "default");

        let up = connector.connect("up:11210").await;
        let down = connector.connect("down:11210").await;
        assert!(up.is_available());
        assert!(!down.is_available());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connector_auth_failure_closes_pool() {
        let factory = Arc::new(TestFactory::default());
        let connector =
            NodeConnector::new(factory.clone(), "secure").with_sasl(Arc::new(RejectingSasl), "pw");
        let node = connector.connect("n1:11210").await;
        assert!(!node.is_connected());
        assert!(node.is_auth_failed());
        let err = node.probe(1).await.unwrap_err();
        assert!(matches!(err, CouchError::Authentication(_)));
        assert!(err.is_fatal());
        let pools = factory.pools.lock();
        assert_eq!(pools.len(), 1);
        assert!(pools[0].1.closed.load(Ordering::SeqCst));
    }
}
