//! Topology document model.
//!
//! A topology document describes one bucket: its type, the node list, the
//! revision, and (for partitioned buckets) the partition map.

use serde::{Deserialize, Serialize};

use couch_common::error::{CouchError, CouchResult};
use couch_common::types::Revision;

/// Placeholder the server uses for "the host you fetched this document from".
pub const HOST_PLACEHOLDER: &str = "$HOST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    #[serde(alias = "membase")]
    Couchbase,
    Memcached,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLocator {
    Vbucket,
    Ketama,
}

/// Partition table: partition index → `[active, replica1, replica2, ...]`
/// node indices into `server_list`. `-1` marks an unassigned slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketServerMap {
    #[serde(default)]
    pub hash_algorithm: String,
    #[serde(default)]
    pub num_replicas: u32,
    #[serde(default)]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
    #[serde(
        default,
        rename = "vBucketMapForward",
        skip_serializing_if = "Option::is_none"
    )]
    pub vbucket_map_forward: Option<Vec<Vec<i32>>>,
}

impl VBucketServerMap {
    pub fn partition_count(&self) -> usize {
        self.vbucket_map.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    /// Key-value (binary protocol) port.
    #[serde(default)]
    pub direct: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// `host:adminPort` as advertised by the cluster.
    pub hostname: String,
    #[serde(default)]
    pub ports: NodePorts,
}

impl NodeEntry {
    /// `host:kvPort`, the identity used for connections and node diffs.
    pub fn address(&self) -> String {
        if self.ports.direct == 0 {
            return self.hostname.clone();
        }
        let host = match self.hostname.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => self.hostname.as_str(),
        };
        format!("{}:{}", host, self.ports.direct)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConfig {
    pub name: String,
    pub bucket_type: BucketType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_locator: Option<NodeLocator>,
    #[serde(default)]
    pub rev: u64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub nodes: Vec<NodeEntry>,
    #[serde(
        default,
        rename = "vBucketServerMap",
        skip_serializing_if = "Option::is_none"
    )]
    pub vbucket_server_map: Option<VBucketServerMap>,
}

impl BucketConfig {
    pub fn revision(&self) -> Revision {
        Revision(self.rev)
    }

    /// Explicit locator, or the bucket type's default.
    pub fn locator(&self) -> NodeLocator {
        match (self.node_locator, self.bucket_type) {
            (Some(locator), _) => locator,
            (None, BucketType::Memcached) => NodeLocator::Ketama,
            (None, _) => NodeLocator::Vbucket,
        }
    }

    /// Ordered key-value node addresses. For partitioned buckets this is the
    /// partition map's server list, which the map's indices refer to.
    pub fn data_node_addresses(&self) -> Vec<String> {
        match (self.locator(), &self.vbucket_server_map) {
            (NodeLocator::Vbucket, Some(map)) => map.server_list.clone(),
            _ => self.nodes.iter().map(NodeEntry::address).collect(),
        }
    }

    pub fn same_nodes(&self, other: &BucketConfig) -> bool {
        self.data_node_addresses() == other.data_node_addresses()
    }

    pub fn same_partition_map(&self, other: &BucketConfig) -> bool {
        self.vbucket_server_map == other.vbucket_server_map
    }

    pub fn validate(&self) -> CouchResult<()> {
        if self.name.is_empty() {
            return Err(CouchError::Configuration(
                "topology document has no bucket name".into(),
            ));
        }
        match self.locator() {
            NodeLocator::Vbucket => {
                let map = self.vbucket_server_map.as_ref().ok_or_else(|| {
                    CouchError::Configuration(format!(
                        "bucket '{}' uses vbucket locator but has no vBucketServerMap",
                        self.name
                    ))
                })?;
                if map.server_list.is_empty() {
                    return Err(CouchError::Configuration(format!(
                        "bucket '{}' has an empty server list",
                        self.name
                    )));
                }
                if map.vbucket_map.is_empty() || map.vbucket_map.len() > u16::MAX as usize + 1 {
                    return Err(CouchError::Configuration(format!(
                        "bucket '{}' has an invalid partition count {}",
                        self.name,
                        map.vbucket_map.len()
                    )));
                }
                if let Some(p) = map.vbucket_map.iter().position(|row| row.is_empty()) {
                    return Err(CouchError::Configuration(format!(
                        "bucket '{}' partition {} has no active entry",
                        self.name, p
                    )));
                }
            }
            NodeLocator::Ketama => {
                if self.nodes.is_empty() {
                    return Err(CouchError::Configuration(format!(
                        "bucket '{}' has no nodes",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a topology document.
///
/// `source_host` replaces `$HOST` placeholders; pass the host the document
/// was fetched from (or that returned it in a not-my-partition response).
pub fn parse_bucket_config(raw: &[u8], source_host: Option<&str>) -> CouchResult<BucketConfig> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| CouchError::Configuration(format!("topology document is not UTF-8: {}", e)))?;
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Err(CouchError::Configuration("null topology document".into()));
    }
    let text = match source_host {
        Some(host) if text.contains(HOST_PLACEHOLDER) => text.replace(HOST_PLACEHOLDER, host),
        _ => text.to_string(),
    };
    let config: BucketConfig = serde_json::from_str(&text)
        .map_err(|e| CouchError::Configuration(format!("malformed topology document: {}", e)))?;
    config.validate()?;
    Ok(config)
}
