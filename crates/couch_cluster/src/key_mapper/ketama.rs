//! Consistent-hash ring for buckets without a partition map.

use std::sync::Arc;

use md5::{Digest, Md5};

use couch_common::error::{CouchError, CouchResult};
use couch_common::types::Revision;

use crate::key_mapper::KeyTarget;
use crate::node::Node;

fn ring_hash(data: &[u8]) -> u32 {
    let digest = Md5::digest(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug)]
pub struct KetamaKeyMapper {
    revision: Revision,
    /// `(position, node index)`, sorted by position.
    ring: Vec<(u32, usize)>,
    nodes: Vec<Arc<Node>>,
}

impl KetamaKeyMapper {
    pub fn new(revision: Revision, nodes: Vec<Arc<Node>>, points_per_node: usize) -> CouchResult<Self> {
        if nodes.is_empty() {
            return Err(CouchError::Configuration(
                "ketama ring needs at least one node".into(),
            ));
        }
        let points_per_node = points_per_node.max(1);
        let mut ring = Vec::with_capacity(nodes.len() * points_per_node);
        for (index, node) in nodes.iter().enumerate() {
            for point in 0..points_per_node {
                let label = format!("{}-{}", node.address(), point);
                ring.push((ring_hash(label.as_bytes()), index));
            }
        }
        ring.sort_unstable();
        Ok(Self {
            revision,
            ring,
            nodes,
        })
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }

    /// First ring position at or after the key's hash, wrapping to the start.
    pub fn resolve(&self, key: &[u8]) -> CouchResult<KeyTarget> {
        let hash = ring_hash(key);
        let slot = self.ring.partition_point(|(position, _)| *position < hash);
        let (_, index) = self
            .ring
            .get(slot)
            .or_else(|| self.ring.first())
            .copied()
            .ok_or_else(|| CouchError::Internal("empty ketama ring".into()))?;
        let primary = self.nodes.get(index).cloned().ok_or(CouchError::TopologyInconsistency {
            partition: 0,
            index: index as i32,
            node_count: self.nodes.len(),
        })?;
        Ok(KeyTarget {
            partition: None,
            primary,
            replicas: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use std::collections::HashMap;

    fn ring(addrs: &[&str]) -> KetamaKeyMapper {
        let nodes = addrs
            .iter()
            .map(|a| Arc::new(Node::unavailable(*a, BreakerConfig::default())))
            .collect();
        KetamaKeyMapper::new(Revision(1), nodes, 160).unwrap()
    }

    fn owner(m: &KetamaKeyMapper, key: &str) -> String {
        m.resolve(key.as_bytes()).unwrap().primary.address().to_string()
    }

    #[test]
    fn test_ring_size_and_order() {
        let m = ring(&["10.0.0.1:11210", "10.0.0.2:11210", "10.0.0.3:11210"]);
        assert_eq!(m.ring_len(), 480);
        assert!(m.ring.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_empty_node_list_rejected() {
        let err = KetamaKeyMapper::new(Revision(1), vec![], 160).unwrap_err();
        assert!(matches!(err, CouchError::Configuration(_)));
    }

    #[test]
    fn test_resolution_is_deterministic_and_spread() {
        let m = ring(&["10.0.0.1:11210", "10.0.0.2:11210", "10.0.0.3:11210"]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..3000 {
            let key = format!("session:{i}");
            let a = owner(&m, &key);
            assert_eq!(a, owner(&m, &key));
            *counts.entry(a).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c > 300), "{counts:?}");
    }

    #[test]
    fn test_key_past_last_point_wraps() {
        let m = ring(&["a:11210", "b:11210"]);
        let last = m.ring.last().unwrap().0;
        // Find a key hashing beyond the last ring position, if any exists in range.
        let beyond = (0..100_000)
            .map(|i| format!("wrap-{i}"))
            .find(|k| ring_hash(k.as_bytes()) > last);
        if let Some(key) = beyond {
            let first_owner = m.nodes[m.ring[0].1].address().to_string();
            assert_eq!(owner(&m, &key), first_owner);
        }
    }

    #[test]
    fn test_removing_node_only_moves_its_keys() {
        let before = ring(&["a:11210", "b:11210", "c:11210"]);
        let after = ring(&["a:11210", "c:11210"]);
        for i in 0..1000 {
            let key = format!("k{i}");
            let old = owner(&before, &key);
            if old != "b:11210" {
                assert_eq!(owner(&after, &key), old, "{key}");
            }
        }
    }
}
