//! Key → node resolution.
//!
//! A `KeyMapper` is bound to exactly one topology revision and is never
//! mutated; a topology change builds a new one and the context swaps it in.

pub mod ketama;
pub mod vbucket;

use std::sync::Arc;

use couch_common::error::{CouchError, CouchResult};
use couch_common::types::{PartitionId, Revision};

use crate::node::Node;
use crate::topology::{BucketConfig, NodeLocator};

pub use ketama::KetamaKeyMapper;
pub use vbucket::{vbucket_hash, VBucketKeyMapper};

/// Where a key lives under one topology snapshot.
#[derive(Debug, Clone)]
pub struct KeyTarget {
    /// Owning partition; `None` for Ketama buckets.
    pub partition: Option<PartitionId>,
    pub primary: Arc<Node>,
    /// Replica slots in order. `None` marks an unassigned slot.
    pub replicas: Vec<Option<Arc<Node>>>,
}

impl KeyTarget {
    /// Node in replica slot `index` (0-based).
    pub fn replica(&self, index: usize) -> CouchResult<Arc<Node>> {
        let partition = self.partition.ok_or_else(|| {
            CouchError::InvalidOperation("replica reads require a partitioned bucket".into())
        })?;
        self.replicas
            .get(index)
            .cloned()
            .flatten()
            .ok_or(CouchError::NoReplicasFound {
                partition: partition.0,
            })
    }
}

/// Picks the mapper variant for a bucket. Chosen once, when the bucket
/// type is first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMapperStrategy {
    VBucket,
    Ketama,
}

impl KeyMapperStrategy {
    pub fn for_config(config: &BucketConfig) -> Self {
        match config.locator() {
            NodeLocator::Vbucket => KeyMapperStrategy::VBucket,
            NodeLocator::Ketama => KeyMapperStrategy::Ketama,
        }
    }

    /// Build a mapper over `nodes`, which must be ordered like
    /// `config.data_node_addresses()`.
    pub fn build(
        self,
        config: &BucketConfig,
        nodes: &[Arc<Node>],
        points_per_node: usize,
    ) -> CouchResult<KeyMapper> {
        match self {
            KeyMapperStrategy::VBucket => {
                let map = config.vbucket_server_map.as_ref().ok_or_else(|| {
                    CouchError::Configuration(format!(
                        "bucket '{}' has no partition map",
                        config.name
                    ))
                })?;
                Ok(KeyMapper::VBucket(VBucketKeyMapper::new(
                    config.revision(),
                    map,
                    nodes.to_vec(),
                )))
            }
            KeyMapperStrategy::Ketama => Ok(KeyMapper::Ketama(KetamaKeyMapper::new(
                config.revision(),
                nodes.to_vec(),
                points_per_node,
            )?)),
        }
    }
}

impl std::fmt::Display for KeyMapperStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMapperStrategy::VBucket => write!(f, "vbucket"),
            KeyMapperStrategy::Ketama => write!(f, "ketama"),
        }
    }
}

#[derive(Debug)]
pub enum KeyMapper {
    VBucket(VBucketKeyMapper),
    Ketama(KetamaKeyMapper),
}

impl KeyMapper {
    pub fn strategy(&self) -> KeyMapperStrategy {
        match self {
            KeyMapper::VBucket(_) => KeyMapperStrategy::VBucket,
            KeyMapper::Ketama(_) => KeyMapperStrategy::Ketama,
        }
    }

    /// Revision the mapper was built from. A revision-only topology change
    /// keeps the existing mapper, so this can be older than
    /// `TopologySnapshot::revision`, which is the one to route by.
    pub fn revision(&self) -> Revision {
        match self {
            KeyMapper::VBucket(m) => m.revision(),
            KeyMapper::Ketama(m) => m.revision(),
        }
    }

    pub fn resolve(&self, key: &[u8]) -> CouchResult<KeyTarget> {
        match self {
            KeyMapper::VBucket(m) => m.resolve(key),
            KeyMapper::Ketama(m) => m.resolve(key),
        }
    }

    /// Resolve against the fast-forward map. `None` when the mapper has none.
    pub fn resolve_forward(&self, key: &[u8]) -> Option<CouchResult<KeyTarget>> {
        match self {
            KeyMapper::VBucket(m) if m.has_forward_map() => {
                Some(m.resolve_partition(m.partition_for(key), true))
            }
            _ => None,
        }
    }

    /// Node serving replica slot `index` for `key`.
    pub fn resolve_replica(&self, key: &[u8], index: usize) -> CouchResult<(PartitionId, Arc<Node>)> {
        match self {
            KeyMapper::VBucket(m) => {
                let target = m.resolve(key)?;
                let node = target.replica(index)?;
                let partition = m.partition_for(key);
                Ok((partition, node))
            }
            KeyMapper::Ketama(_) => Err(CouchError::InvalidOperation(
                "replica reads are not supported by ketama buckets".into(),
            )),
        }
    }
}
