//! Bucket topology context.
//!
//! Holds the current `(revision, nodes, key mapper)` as one immutable
//! `TopologySnapshot` behind a single `Arc` swap. `load_topology` diffs an
//! incoming document against the current snapshot and rebuilds only what
//! changed: live node connections are carried over, the key mapper is rebuilt
//! only when the node list or the partition map differ. Nodes left
//! unconnected by an earlier load are connected again on every load.
//!
//! Evicted nodes stop accepting dispatches at once and are disposed as soon
//! as their in-flight dispatches finish.
//!
//! Loads must be serialized by the caller (see `ConfigWatcher`).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinSet;

use couch_common::config::TopologyConfig;
use couch_common::error::{CouchError, CouchResult};
use couch_common::types::Revision;

use crate::key_mapper::{KeyMapper, KeyMapperStrategy};
use crate::node::{Node, NodeConnector};
use crate::topology::BucketConfig;

/// What a `load_topology` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    /// First document for this context.
    Initial,
    /// Same revision, same content.
    Unchanged,
    /// Older than the current revision; ignored.
    Stale,
    /// New revision, same nodes and partition map.
    RevisionOnly,
    /// Partition assignments changed; nodes reused.
    PartitionMap,
    /// Node list changed.
    Nodes,
}

impl TopologyChange {
    pub fn as_str(self) -> &'static str {
        match self {
            TopologyChange::Initial => "initial",
            TopologyChange::Unchanged => "unchanged",
            TopologyChange::Stale => "stale",
            TopologyChange::RevisionOnly => "revision_only",
            TopologyChange::PartitionMap => "partition_map",
            TopologyChange::Nodes => "nodes",
        }
    }

    /// Whether a new snapshot was published.
    pub fn is_applied(self) -> bool {
        !matches!(self, TopologyChange::Unchanged | TopologyChange::Stale)
    }
}

impl std::fmt::Display for TopologyChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One consistent view of the bucket topology.
#[derive(Debug)]
pub struct TopologySnapshot {
    revision: Revision,
    config: Arc<BucketConfig>,
    /// Ordered like `config.data_node_addresses()`.
    nodes: Vec<Arc<Node>>,
    key_mapper: Arc<KeyMapper>,
}

impl TopologySnapshot {
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn config(&self) -> &Arc<BucketConfig> {
        &self.config
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn key_mapper(&self) -> &Arc<KeyMapper> {
        &self.key_mapper
    }

    pub fn node(&self, address: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.address() == address).cloned()
    }
}

pub struct ConfigContext {
    bucket: String,
    connector: Arc<NodeConnector>,
    points_per_node: usize,
    strategy: OnceLock<KeyMapperStrategy>,
    current: RwLock<Option<Arc<TopologySnapshot>>>,
    /// Evicted nodes waiting for their in-flight dispatches to drain.
    retiring: Arc<Mutex<Vec<Arc<Node>>>>,
}

impl ConfigContext {
    pub fn new(connector: Arc<NodeConnector>, config: &TopologyConfig) -> Self {
        Self {
            bucket: connector.bucket().to_string(),
            connector,
            points_per_node: config.ketama_points_per_node.max(1) as usize,
            strategy: OnceLock::new(),
            current: RwLock::new(None),
            retiring: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn strategy(&self) -> Option<KeyMapperStrategy> {
        self.strategy.get().copied()
    }

    pub fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.read().clone()
    }

    pub fn revision(&self) -> Option<Revision> {
        self.current.read().as_ref().map(|s| s.revision)
    }

    pub fn current_key_mapper(&self) -> CouchResult<Arc<KeyMapper>> {
        self.snapshot()
            .map(|s| s.key_mapper.clone())
            .ok_or_else(|| self.not_bootstrapped())
    }

    pub fn current_nodes(&self) -> Vec<Arc<Node>> {
        self.snapshot().map(|s| s.nodes.clone()).unwrap_or_default()
    }

    pub fn retiring_count(&self) -> usize {
        self.retiring.lock().len()
    }

    fn not_bootstrapped(&self) -> CouchError {
        CouchError::Configuration(format!("bucket '{}' has no topology loaded", self.bucket))
    }

    /// Apply a topology document.
    pub async fn load_topology(&self, config: BucketConfig) -> CouchResult<TopologyChange> {
        config.validate()?;
        if config.name != self.bucket {
            return Err(CouchError::Configuration(format!(
                "topology for bucket '{}' delivered to context of bucket '{}'",
                config.name, self.bucket
            )));
        }
        let strategy = KeyMapperStrategy::for_config(&config);
        let bound = *self.strategy.get_or_init(|| strategy);
        if bound != strategy {
            return Err(CouchError::Configuration(format!(
                "bucket '{}' changed node locator from {} to {}",
                self.bucket, bound, strategy
            )));
        }

        let current = self.snapshot();
        // Nodes that could not be connected are rebuilt on every load.
        let reconnect = current
            .as_ref()
            .is_some_and(|c| c.nodes.iter().any(|n| !n.is_connected()));
        let change = match &current {
            None => TopologyChange::Initial,
            Some(cur) if config.revision() < cur.revision => {
                tracing::debug!(
                    bucket = %self.bucket,
                    current = cur.revision.0,
                    incoming = config.rev,
                    "ignoring stale topology"
                );
                return Ok(TopologyChange::Stale);
            }
            Some(cur) => {
                let same_nodes = cur.config.same_nodes(&config);
                let same_map = cur.config.same_partition_map(&config);
                match (same_nodes, same_map) {
                    (true, true) if config.revision() == cur.revision && !reconnect => {
                        return Ok(TopologyChange::Unchanged);
                    }
                    (true, true) => TopologyChange::RevisionOnly,
                    (true, false) => TopologyChange::PartitionMap,
                    (false, _) => TopologyChange::Nodes,
                }
            }
        };

        let addresses = config.data_node_addresses();
        let (nodes, evicted) = match (&current, change) {
            (Some(cur), TopologyChange::RevisionOnly | TopologyChange::PartitionMap)
                if !reconnect =>
            {
                (cur.nodes.clone(), Vec::new())
            }
            (cur, _) => self.diff_nodes(cur.as_deref(), &addresses).await?,
        };

        let key_mapper = match (&current, change) {
            (Some(cur), TopologyChange::RevisionOnly) if !reconnect => cur.key_mapper.clone(),
            _ => Arc::new(strategy.build(&config, &nodes, self.points_per_node)?),
        };

        let snapshot = Arc::new(TopologySnapshot {
            revision: config.revision(),
            config: Arc::new(config),
            nodes,
            key_mapper,
        });
        *self.current.write() = Some(snapshot.clone());

        for node in &evicted {
            node.retire();
        }
        self.retiring.lock().extend(evicted.iter().cloned());

        let unavailable = snapshot.nodes.iter().filter(|n| !n.is_connected()).count();
        tracing::info!(
            bucket = %self.bucket,
            rev = snapshot.revision.0,
            change = %change,
            nodes = snapshot.nodes.len(),
            unavailable,
            evicted = evicted.len(),
            "topology applied"
        );
        couch_observability::record_topology_change(&self.bucket, change.as_str(), snapshot.revision.0);

        self.dispose_drained().await;
        let draining: Vec<Arc<Node>> = {
            let retiring = self.retiring.lock();
            evicted
                .iter()
                .filter(|n| retiring.iter().any(|r| Arc::ptr_eq(r, *n)))
                .cloned()
                .collect()
        };
        for node in draining {
            self.spawn_drain(node);
        }
        couch_observability::record_node_counts(
            &self.bucket,
            snapshot.nodes.len() - unavailable,
            unavailable,
            self.retiring_count(),
        );
        Ok(change)
    }

    /// Reuse live nodes by address and connect the new ones concurrently.
    /// Returns the ordered node list and the nodes no longer referenced.
    async fn diff_nodes(
        &self,
        current: Option<&TopologySnapshot>,
        addresses: &[String],
    ) -> CouchResult<(Vec<Arc<Node>>, Vec<Arc<Node>>)> {
        let mut by_address: HashMap<String, Arc<Node>> = HashMap::new();
        let mut disconnected = Vec::new();
        for node in current.map(|c| c.nodes.as_slice()).unwrap_or_default() {
            if node.is_connected() {
                by_address.insert(node.address().to_string(), node.clone());
            } else {
                disconnected.push(node.clone());
            }
        }

        let mut connects = JoinSet::new();
        let mut pending: Vec<&String> = Vec::new();
        for address in addresses {
            if by_address.contains_key(address) || pending.contains(&address) {
                continue;
            }
            pending.push(address);
            let connector = self.connector.clone();
            let address = address.clone();
            connects.spawn(async move {
                let node = connector.connect(&address).await;
                (address, node)
            });
        }

        let mut connected: HashMap<String, Arc<Node>> = HashMap::with_capacity(pending.len());
        while let Some(joined) = connects.join_next().await {
            let (address, node) = joined
                .map_err(|e| CouchError::Internal(format!("node connect task failed: {}", e)))?;
            connected.insert(address, node);
        }

        let mut nodes = Vec::with_capacity(addresses.len());
        for address in addresses {
            let node = by_address
                .get(address)
                .or_else(|| connected.get(address))
                .cloned()
                .ok_or_else(|| CouchError::Internal(format!("no node built for {}", address)))?;
            nodes.push(node);
        }

        by_address.retain(|address, _| !addresses.contains(address));
        let mut evicted: Vec<Arc<Node>> = by_address.into_values().collect();
        evicted.extend(disconnected);
        Ok((nodes, evicted))
    }

    /// Dispose `node` once its in-flight dispatches finish, unless someone
    /// else takes it off the retiring list first.
    fn spawn_drain(&self, node: Arc<Node>) {
        let retiring = self.retiring.clone();
        let bucket = self.bucket.clone();
        tokio::spawn(async move {
            node.wait_drained().await;
            let removed = {
                let mut retiring = retiring.lock();
                let before = retiring.len();
                retiring.retain(|n| !Arc::ptr_eq(n, &node));
                retiring.len() != before
            };
            if removed {
                node.dispose().await;
                tracing::info!(bucket = %bucket, node = %node.address(), "drained node disposed");
            }
        });
    }

    /// Dispose retired nodes with no dispatch in flight. Returns how many
    /// were disposed.
    pub async fn dispose_drained(&self) -> usize {
        let drained: Vec<Arc<Node>> = {
            let mut retiring = self.retiring.lock();
            let (drained, busy): (Vec<_>, Vec<_>) =
                retiring.drain(..).partition(|n| n.in_flight() == 0);
            *retiring = busy;
            drained
        };
        for node in &drained {
            node.dispose().await;
        }
        if !drained.is_empty() {
            tracing::info!(bucket = %self.bucket, disposed = drained.len(), "retired nodes disposed");
        }
        drained.len()
    }

    /// Tear down every node. The context has no topology afterwards.
    pub async fn shutdown(&self) {
        let snapshot = self.current.write().take();
        if let Some(snapshot) = snapshot {
            for node in snapshot.nodes() {
                node.retire();
            }
            self.retiring.lock().extend(snapshot.nodes.iter().cloned());
        }
        let mut remaining: Vec<Arc<Node>> = std::mem::take(&mut *self.retiring.lock());
        for node in remaining.drain(..) {
            node.dispose().await;
        }
        tracing::info!(bucket = %self.bucket, "config context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::TestFactory;
    use crate::node::DispatchGuard;
    use crate::topology::tests::vbucket_doc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn context(factory: Arc<TestFactory>) -> ConfigContext {
        let connector = Arc::new(NodeConnector::new(factory, "default"));
        ConfigContext::new(connector, &TopologyConfig::default())
    }

    fn map(partitions: usize, nodes: i32) -> Vec<Vec<i32>> {
        (0..partitions as i32).map(|p| vec![p % nodes]).collect()
    }

    #[tokio::test]
    async fn test_initial_load_builds_everything() {
        let factory = Arc::new(TestFactory::default());
        let ctx = context(factory.clone());
        assert!(ctx.current_key_mapper().is_err());

        let change = ctx
            .load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(16, 2)))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::Initial);
        assert_eq!(ctx.revision(), Some(Revision(1)));
        assert_eq!(ctx.current_nodes().len(), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.strategy(), Some(KeyMapperStrategy::VBucket));
    }

    #[tokio::test]
    async fn test_same_document_is_unchanged() {
        let ctx = context(Arc::new(TestFactory::default()));
        let doc = vbucket_doc(4, &["a:11210"], map(8, 1));
        ctx.load_topology(doc.clone()).await.unwrap();
        let before = ctx.snapshot().unwrap();
        assert_eq!(ctx.load_topology(doc).await.unwrap(), TopologyChange::Unchanged);
        assert!(Arc::ptr_eq(&before, &ctx.snapshot().unwrap()));
    }

    #[tokio::test]
    async fn test_stale_revision_ignored() {
        let ctx = context(Arc::new(TestFactory::default()));
        ctx.load_topology(vbucket_doc(10, &["a:11210"], map(8, 1))).await.unwrap();
        let change = ctx
            .load_topology(vbucket_doc(9, &["b:11210"], map(8, 1)))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::Stale);
        assert_eq!(ctx.current_nodes()[0].address(), "a:11210");
    }

    #[tokio::test]
    async fn test_revision_only_keeps_mapper() {
        let ctx = context(Arc::new(TestFactory::default()));
        ctx.load_topology(vbucket_doc(1, &["a:11210"], map(8, 1))).await.unwrap();
        let mapper = ctx.current_key_mapper().unwrap();
        let change = ctx
            .load_topology(vbucket_doc(2, &["a:11210"], map(8, 1)))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::RevisionOnly);
        assert_eq!(ctx.revision(), Some(Revision(2)));
        assert!(Arc::ptr_eq(&mapper, &ctx.current_key_mapper().unwrap()));
        assert_eq!(ctx.current_key_mapper().unwrap().revision(), Revision(1));
        assert_eq!(ctx.snapshot().unwrap().revision(), Revision(2));
    }

    #[tokio::test]
    async fn test_partition_map_change_reuses_nodes() {
        let factory = Arc::new(TestFactory::default());
        let ctx = context(factory.clone());
        ctx.load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(8, 2))).await.unwrap();
        let old_nodes = ctx.current_nodes();
        let old_mapper = ctx.current_key_mapper().unwrap();

        let swapped: Vec<Vec<i32>> = (0..8).map(|p| vec![(p + 1) % 2]).collect();
        let change = ctx
            .load_topology(vbucket_doc(2, &["a:11210", "b:11210"], swapped))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::PartitionMap);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        let new_nodes = ctx.current_nodes();
        assert!(old_nodes.iter().zip(&new_nodes).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert!(!Arc::ptr_eq(&old_mapper, &ctx.current_key_mapper().unwrap()));
    }

    #[tokio::test]
    async fn test_node_change_connects_new_and_retires_removed() {
        let factory = Arc::new(TestFactory::default());
        let ctx = context(factory.clone());
        ctx.load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(8, 2))).await.unwrap();
        let a = ctx.snapshot().unwrap().node("a:11210").unwrap();
        let b = ctx.snapshot().unwrap().node("b:11210").unwrap();

        let change = ctx
            .load_topology(vbucket_doc(2, &["a:11210", "c:11210"], map(8, 2)))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::Nodes);
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert!(Arc::ptr_eq(&a, &ctx.snapshot().unwrap().node("a:11210").unwrap()));
        assert!(b.is_retired());
        // Nothing was in flight on b, so it is disposed right away.
        assert_eq!(ctx.retiring_count(), 0);
        let pools = factory.pools.lock();
        let b_pool = pools.iter().find(|(addr, _)| addr == "b:11210").unwrap();
        assert!(b_pool.1.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_evicted_node_disposed_once_drained() {
        let factory = Arc::new(TestFactory::default());
        let ctx = context(factory.clone());
        ctx.load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(8, 2))).await.unwrap();
        let b = ctx.snapshot().unwrap().node("b:11210").unwrap();
        let b_pool = factory
            .pools
            .lock()
            .iter()
            .find(|(addr, _)| addr == "b:11210")
            .map(|(_, pool)| pool.clone())
            .unwrap();

        let in_flight = DispatchGuard::new(&b);
        ctx.load_topology(vbucket_doc(2, &["a:11210"], map(8, 1))).await.unwrap();
        assert!(b.is_retired());
        assert_eq!(ctx.retiring_count(), 1);
        assert!(!b_pool.closed.load(Ordering::SeqCst));

        // No further topology load: the drain alone closes the pool.
        drop(in_flight);
        for _ in 0..200 {
            if b_pool.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(b_pool.closed.load(Ordering::SeqCst));
        assert_eq!(ctx.retiring_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_node_reconnected_on_later_load() {
        let factory = Arc::new(TestFactory::default());
        factory.unreachable.lock().insert("b:11210".into());
        let ctx = context(factory.clone());
        ctx.load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(8, 2))).await.unwrap();
        let stale_b = ctx.snapshot().unwrap().node("b:11210").unwrap();
        assert!(!stale_b.is_connected());

        factory.unreachable.lock().clear();
        let change = ctx
            .load_topology(vbucket_doc(2, &["a:11210", "b:11210"], map(8, 2)))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::RevisionOnly);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        let snapshot = ctx.snapshot().unwrap();
        let b = snapshot.node("b:11210").unwrap();
        assert!(b.is_connected());
        assert!(b.is_available());
        assert!(!Arc::ptr_eq(&b, &stale_b));
        assert!(stale_b.is_retired());
        for i in 0..64 {
            let target = snapshot.key_mapper().resolve(format!("k{i}").as_bytes()).unwrap();
            assert!(target.primary.is_connected(), "k{i}");
        }
    }

    #[tokio::test]
    async fn test_same_revision_retries_unreachable_nodes() {
        let factory = Arc::new(TestFactory::default());
        factory.unreachable.lock().insert("a:11210".into());
        let ctx = context(factory.clone());
        let doc = vbucket_doc(5, &["a:11210"], map(8, 1));
        ctx.load_topology(doc.clone()).await.unwrap();
        assert!(!ctx.current_nodes()[0].is_connected());

        factory.unreachable.lock().clear();
        assert_ne!(ctx.load_topology(doc).await.unwrap(), TopologyChange::Unchanged);
        assert!(ctx.current_nodes()[0].is_connected());
        assert_eq!(ctx.revision(), Some(Revision(5)));
    }

    #[tokio::test]
    async fn test_unreachable_node_marked_unavailable() {
        let factory = Arc::new(TestFactory::default());
        factory.unreachable.lock().insert("b:11210".into());
        let ctx = context(factory);
        let change = ctx
            .load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(8, 2)))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::Initial);
        let b = ctx.snapshot().unwrap().node("b:11210").unwrap();
        assert!(!b.is_available());
        assert!(ctx.snapshot().unwrap().node("a:11210").unwrap().is_available());
    }

    #[tokio::test]
    async fn test_wrong_bucket_and_locator_change_rejected() {
        let ctx = context(Arc::new(TestFactory::default()));
        let mut other = vbucket_doc(1, &["a:11210"], map(8, 1));
        other.name = "travel".into();
        assert!(matches!(
            ctx.load_topology(other).await.unwrap_err(),
            CouchError::Configuration(_)
        ));

        ctx.load_topology(vbucket_doc(1, &["a:11210"], map(8, 1))).await.unwrap();
        let mut ketama = vbucket_doc(2, &["a:11210"], map(8, 1));
        ketama.node_locator = Some(crate::topology::NodeLocator::Ketama);
        ketama.nodes = vec![crate::topology::NodeEntry {
            hostname: "a:11210".into(),
            ports: Default::default(),
        }];
        assert!(matches!(
            ctx.load_topology(ketama).await.unwrap_err(),
            CouchError::Configuration(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_consistent_snapshots() {
        let ctx = Arc::new(context(Arc::new(TestFactory::default())));
        ctx.load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(64, 2))).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        for r in 0..4 {
            let ctx = ctx.clone();
            let stop = stop.clone();
            readers.push(tokio::spawn(async move {
                let mut checked = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    let snap = ctx.snapshot().unwrap();
                    let key = format!("reader-{r}-{checked}");
                    let target = snap.key_mapper().resolve(key.as_bytes()).unwrap();
                    assert!(snap.nodes().iter().any(|n| Arc::ptr_eq(n, &target.primary)));
                    assert_eq!(
                        snap.config().data_node_addresses().len(),
                        snap.nodes().len()
                    );
                    checked += 1;
                    tokio::task::yield_now().await;
                }
                checked
            }));
        }

        let layouts: [&[&str]; 3] = [
            &["a:11210", "c:11210"],
            &["a:11210", "b:11210", "c:11210"],
            &["d:11210", "b:11210"],
        ];
        for rev in 2..30u64 {
            let servers = layouts[rev as usize % layouts.len()];
            let doc = vbucket_doc(rev, servers, map(64, servers.len() as i32));
            ctx.load_topology(doc).await.unwrap();
            tokio::task::yield_now().await;
        }
        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(ctx.revision(), Some(Revision(29)));
    }

    #[tokio::test]
    async fn test_shutdown_disposes_all_nodes() {
        let factory = Arc::new(TestFactory::default());
        let ctx = context(factory.clone());
        ctx.load_topology(vbucket_doc(1, &["a:11210", "b:11210"], map(8, 2))).await.unwrap();
        ctx.shutdown().await;
        assert!(ctx.snapshot().is_none());
        assert!(factory.pools.lock().iter().all(|(_, p)| p.closed.load(Ordering::SeqCst)));
    }
}
