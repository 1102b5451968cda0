#![allow(dead_code, unused_imports)]

//! In-memory cluster for executor integration tests.
//!
//! Every mock node is a small key-value store speaking the binary frame
//! format. Tests can queue scripted replies per node; once the script is
//! empty the node serves requests from its store.

pub use std::sync::Arc;
pub use std::time::Duration;

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

pub use couch_client::{Bucket, Operation, OperationResult, RequestExecutor, RetryPolicy};
pub use couch_cluster::{
    parse_bucket_config, BucketConfig, ConfigContext, ConfigWatcher, ConfigWatcherHandle,
    NodeConnector,
};
pub use couch_common::cancel::CancelSignal;
pub use couch_common::config::{DriverConfig, OperationConfig};
pub use couch_common::error::{CouchError, CouchResult};
pub use couch_protocol::{Flags, OpCode, ResponseStatus, Transcoder, Value};

use couch_cluster::{Connection, ConnectionPool, PoolFactory, SaslMechanism};
use couch_protocol::{decode_request, encode_response, RequestFrame, ResponseFrame};

/// One scripted reply, consumed by the next request a node receives.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with this status and an empty body.
    Status(ResponseStatus),
    /// Not-my-partition, optionally carrying a topology document.
    NotMyPartition(Option<String>),
    /// Fail the write with a transport error.
    Reset,
    /// Never answer.
    Hang,
    /// Answer from the store but with the wrong opaque.
    WrongOpaque,
}

#[derive(Debug, Clone)]
struct Item {
    value: Bytes,
    flags: u32,
    cas: u64,
}

pub struct MockNode {
    address: String,
    script: Mutex<VecDeque<Reply>>,
    store: Mutex<HashMap<Vec<u8>, Item>>,
    requests: Mutex<Vec<RequestFrame>>,
    next_cas: Mutex<u64>,
}

impl MockNode {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            script: Mutex::new(VecDeque::new()),
            store: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            next_cas: Mutex::new(100),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().extend(replies);
    }

    /// Seed a document with explicit flags and CAS.
    pub fn put(&self, key: &str, value: &[u8], flags: Flags, cas: u64) {
        self.store.lock().insert(
            key.as_bytes().to_vec(),
            Item {
                value: Bytes::copy_from_slice(value),
                flags: flags.to_u32(),
                cas,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.lock().contains_key(key.as_bytes())
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<RequestFrame> {
        self.requests.lock().clone()
    }

    fn bump_cas(&self) -> u64 {
        let mut cas = self.next_cas.lock();
        *cas += 1;
        *cas
    }

    fn respond(&self, req: &RequestFrame) -> ResponseFrame {
        let mut resp = ResponseFrame::new(req.opcode, ResponseStatus::Success, req.opaque);
        let mut store = self.store.lock();
        let key = req.key.to_vec();
        match req.opcode {
            OpCode::Get | OpCode::GetReplica => match store.get(&key) {
                Some(item) => {
                    resp.extras = Bytes::copy_from_slice(&item.flags.to_be_bytes());
                    resp.value = item.value.clone();
                    resp.cas = item.cas;
                }
                None => resp.status = ResponseStatus::KeyNotFound,
            },
            OpCode::Set | OpCode::Add | OpCode::Replace => {
                let existing = store.get(&key).map(|i| i.cas);
                let status = match (req.opcode, existing) {
                    (OpCode::Add, Some(_)) => Some(ResponseStatus::KeyExists),
                    (OpCode::Replace, None) => Some(ResponseStatus::KeyNotFound),
                    (_, Some(cas)) if req.cas != 0 && req.cas != cas => {
                        Some(ResponseStatus::KeyExists)
                    }
                    _ => None,
                };
                match status {
                    Some(status) => resp.status = status,
                    None => {
                        let flags = u32::from_be_bytes([
                            req.extras[0],
                            req.extras[1],
                            req.extras[2],
                            req.extras[3],
                        ]);
                        let cas = self.bump_cas();
                        store.insert(
                            key,
                            Item {
                                value: req.value.clone(),
                                flags,
                                cas,
                            },
                        );
                        resp.cas = cas;
                    }
                }
            }
            OpCode::Delete => match store.get(&key).map(|i| i.cas) {
                Some(cas) if req.cas != 0 && req.cas != cas => {
                    resp.status = ResponseStatus::KeyExists
                }
                Some(_) => {
                    store.remove(&key);
                }
                None => resp.status = ResponseStatus::KeyNotFound,
            },
            OpCode::Increment | OpCode::Decrement => {
                let read = |at: usize| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&req.extras[at..at + 8]);
                    u64::from_be_bytes(raw)
                };
                let (delta, initial) = (read(0), read(8));
                let next = match store.get(&key) {
                    None => initial,
                    Some(item) => {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&item.value[..8]);
                        let current = u64::from_be_bytes(raw);
                        if req.opcode == OpCode::Increment {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        }
                    }
                };
                let mut value = BytesMut::with_capacity(8);
                value.put_u64(next);
                let value = value.freeze();
                let cas = self.bump_cas();
                store.insert(
                    key,
                    Item {
                        value: value.clone(),
                        flags: 0,
                        cas,
                    },
                );
                resp.value = value;
                resp.cas = cas;
            }
            OpCode::Append | OpCode::Prepend => match store.get_mut(&key) {
                Some(item) => {
                    let mut joined = BytesMut::new();
                    if req.opcode == OpCode::Append {
                        joined.extend_from_slice(&item.value);
                        joined.extend_from_slice(&req.value);
                    } else {
                        joined.extend_from_slice(&req.value);
                        joined.extend_from_slice(&item.value);
                    }
                    item.value = joined.freeze();
                    item.cas += 1;
                    resp.cas = item.cas;
                }
                None => resp.status = ResponseStatus::ItemNotStored,
            },
            _ => {}
        }
        resp
    }
}

struct MockConnection {
    node: Arc<MockNode>,
    pending: Mutex<VecDeque<Bytes>>,
    hang: Mutex<bool>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn write(&self, bytes: Bytes) -> CouchResult<()> {
        let (req, _) = decode_request(&bytes)?;
        self.node.requests.lock().push(req.clone());
        let scripted = self.node.script.lock().pop_front();
        let resp = match scripted {
            None => self.node.respond(&req),
            Some(Reply::Status(status)) => ResponseFrame::new(req.opcode, status, req.opaque),
            Some(Reply::NotMyPartition(body)) => {
                let mut resp = ResponseFrame::new(
                    req.opcode,
                    ResponseStatus::VBucketBelongsToAnotherServer,
                    req.opaque,
                );
                if let Some(body) = body {
                    resp.value = Bytes::from(body);
                }
                resp
            }
            Some(Reply::Reset) => {
                return Err(CouchError::transport(&self.node.address, "connection reset"));
            }
            Some(Reply::Hang) => {
                *self.hang.lock() = true;
                return Ok(());
            }
            Some(Reply::WrongOpaque) => {
                let mut resp = self.node.respond(&req);
                resp.opaque = req.opaque.wrapping_add(1000);
                resp
            }
        };
        self.pending.lock().push_back(encode_response(&resp).freeze());
        Ok(())
    }

    async fn read_response(&self) -> CouchResult<Bytes> {
        if *self.hang.lock() {
            std::future::pending::<()>().await;
        }
        self.pending
            .lock()
            .pop_front()
            .ok_or_else(|| CouchError::transport(&self.node.address, "no response buffered"))
    }

    fn local_endpoint(&self) -> String {
        "127.0.0.1:40000".into()
    }

    fn remote_endpoint(&self) -> String {
        self.node.address.clone()
    }
}

/// Hands out a fresh connection per acquire, so concurrent operations
/// never read each other's responses.
struct MockPool {
    node: Arc<MockNode>,
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn acquire(&self) -> CouchResult<Arc<dyn Connection>> {
        Ok(Arc::new(MockConnection {
            node: self.node.clone(),
            pending: Mutex::new(VecDeque::new()),
            hang: Mutex::new(false),
        }))
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct MockCluster {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockCluster {
    pub fn new(addresses: &[&str]) -> Arc<Self> {
        let cluster = Self::default();
        for address in addresses {
            cluster
                .nodes
                .lock()
                .insert(address.to_string(), Arc::new(MockNode::new(address)));
        }
        Arc::new(cluster)
    }

    pub fn node(&self, address: &str) -> Arc<MockNode> {
        self.nodes
            .lock()
            .get(address)
            .cloned()
            .unwrap_or_else(|| panic!("no mock node {address}"))
    }

    pub fn set_unreachable(&self, address: &str) {
        self.unreachable.lock().insert(address.to_string());
    }
}

#[async_trait]
impl PoolFactory for MockCluster {
    async fn create_pool(&self, address: &str) -> CouchResult<Arc<dyn ConnectionPool>> {
        if self.unreachable.lock().contains(address) {
            return Err(CouchError::transport(address, "connection refused"));
        }
        let node = self
            .nodes
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| CouchError::transport(address, "unknown host"))?;
        Ok(Arc::new(MockPool { node }))
    }
}

/// SASL mechanism that refuses every password.
pub struct RejectingSasl;

#[async_trait]
impl SaslMechanism for RejectingSasl {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    async fn authenticate(&self, _: &dyn Connection, bucket: &str, _: &str) -> CouchResult<()> {
        Err(CouchError::Authentication(format!("invalid credentials for bucket {bucket}")))
    }
}

/// Topology JSON for bucket `default` with `partitions` partitions, each
/// mapped to the `row` of server indices.
pub fn vbucket_json(rev: u64, servers: &[&str], partitions: usize, row: &[i32]) -> String {
    serde_json::json!({
        "name": "default",
        "bucketType": "couchbase",
        "nodeLocator": "vbucket",
        "rev": rev,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": row.len().saturating_sub(1),
            "serverList": servers,
            "vBucketMap": vec![row.to_vec(); partitions],
        }
    })
    .to_string()
}

pub fn vbucket_config(rev: u64, servers: &[&str], partitions: usize, row: &[i32]) -> BucketConfig {
    parse_bucket_config(vbucket_json(rev, servers, partitions, row).as_bytes(), None)
        .expect("valid topology")
}

pub fn fast_config(timeout_ms: u64, max_attempts: u32) -> DriverConfig {
    let mut config = DriverConfig::default();
    config.operation = OperationConfig {
        timeout_ms,
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 20,
    };
    config
}

pub struct Harness {
    pub cluster: Arc<MockCluster>,
    pub context: Arc<ConfigContext>,
    pub watcher: ConfigWatcherHandle,
    pub executor: Arc<RequestExecutor>,
}

impl Harness {
    pub async fn start(cluster: Arc<MockCluster>, topology: BucketConfig, config: DriverConfig) -> Self {
        let connector = NodeConnector::new(cluster.clone(), config.bucket.name.clone())
            .with_health(&config.node_health);
        Self::start_with_connector(cluster, connector, topology, config).await
    }

    pub async fn start_with_connector(
        cluster: Arc<MockCluster>,
        connector: NodeConnector,
        topology: BucketConfig,
        config: DriverConfig,
    ) -> Self {
        let connector = Arc::new(connector);
        let context = Arc::new(ConfigContext::new(connector, &config.topology));
        context.load_topology(topology).await.expect("bootstrap topology");
        let watcher = ConfigWatcher::spawn(context.clone());
        let executor = Arc::new(
            RequestExecutor::new(context.clone(), Arc::new(Transcoder::new()), &config)
                .with_publisher(Arc::new(watcher.clone())),
        );
        Self {
            cluster,
            context,
            watcher,
            executor,
        }
    }

    pub fn bucket(&self) -> Bucket<RequestExecutor> {
        Bucket::new("default", self.executor.clone())
    }

    pub async fn stop(&self) {
        self.watcher.shutdown().await;
        self.context.shutdown().await;
    }
}
