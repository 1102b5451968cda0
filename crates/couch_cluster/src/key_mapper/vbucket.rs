//! Partition-map key mapper.
//!
//! `partition = ((crc32(key) >> 16) & 0x7fff) % partition_count`, then the
//! partition's row in the map gives `[active, replica1, ...]` node indices.

use std::sync::Arc;

use couch_common::error::{CouchError, CouchResult};
use couch_common::types::{PartitionId, Revision};

use crate::key_mapper::KeyTarget;
use crate::node::Node;
use crate::topology::VBucketServerMap;

/// Partition index for `key` among `partition_count` partitions.
pub fn vbucket_hash(key: &[u8], partition_count: usize) -> u16 {
    if partition_count == 0 {
        return 0;
    }
    let crc = crc32fast::hash(key);
    (((crc >> 16) & 0x7fff) as usize % partition_count) as u16
}

#[derive(Debug)]
pub struct VBucketKeyMapper {
    revision: Revision,
    partitions: Vec<Vec<i32>>,
    forward: Option<Vec<Vec<i32>>>,
    /// Indexed like the map's server list.
    nodes: Vec<Arc<Node>>,
}

impl VBucketKeyMapper {
    pub fn new(revision: Revision, map: &VBucketServerMap, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            revision,
            partitions: map.vbucket_map.clone(),
            forward: map.vbucket_map_forward.clone(),
            nodes,
        }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn has_forward_map(&self) -> bool {
        self.forward.as_ref().is_some_and(|f| !f.is_empty())
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn partition_for(&self, key: &[u8]) -> PartitionId {
        PartitionId(vbucket_hash(key, self.partitions.len()))
    }

    pub fn resolve(&self, key: &[u8]) -> CouchResult<KeyTarget> {
        self.resolve_partition(self.partition_for(key), false)
    }

    pub fn resolve_partition(&self, partition: PartitionId, use_forward: bool) -> CouchResult<KeyTarget> {
        let table = match (&self.forward, use_forward) {
            (Some(forward), true) if !forward.is_empty() => forward,
            _ => &self.partitions,
        };
        let row = table
            .get(partition.0 as usize)
            .ok_or(CouchError::TopologyInconsistency {
                partition: partition.0,
                index: -1,
                node_count: self.nodes.len(),
            })?;

        let active = row.first().copied().unwrap_or(-1);
        let primary = self.node_at(active).ok_or(CouchError::TopologyInconsistency {
            partition: partition.0,
            index: active,
            node_count: self.nodes.len(),
        })?;
        let replicas = row.iter().skip(1).map(|&i| self.node_at(i)).collect();

        Ok(KeyTarget {
            partition: Some(partition),
            primary,
            replicas,
        })
    }

    fn node_at(&self, index: i32) -> Option<Arc<Node>> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.nodes.get(i))
            .cloned()
    }
}
