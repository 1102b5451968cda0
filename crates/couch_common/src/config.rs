use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CouchError, CouchResult};

/// Top-level driver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub bucket: BucketSection,
    #[serde(default)]
    pub operation: OperationConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub node_health: NodeHealthConfig,
    #[serde(default)]
    pub serializer: SerializerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketSection {
    /// Bucket this connection is bound to.
    pub name: String,
    /// SASL password handed to the authentication collaborator.
    pub password: String,
}

impl Default for BucketSection {
    fn default() -> Self {
        Self {
            name: "default".into(),
            password: String::new(),
        }
    }
}

/// Per-operation wait and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Default wait bound for an operation, retries included (default: 2500).
    pub timeout_ms: u64,
    /// Upper bound on dispatch attempts per operation (default: 10).
    pub max_attempts: u32,
    /// First retry delay; doubles up to `max_backoff_ms` (default: 1).
    pub initial_backoff_ms: u64,
    /// Maximum delay between attempts (default: 500).
    pub max_backoff_ms: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2500,
            max_attempts: 10,
            initial_backoff_ms: 1,
            max_backoff_ms: 500,
        }
    }
}

impl OperationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// How long a retry waits for a published topology to be applied (default: 1000).
    pub refresh_timeout_ms: u64,
    /// Ring points per node for consistent-hash buckets (default: 160).
    pub ketama_points_per_node: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            refresh_timeout_ms: 1000,
            ketama_points_per_node: 160,
        }
    }
}

impl TopologyConfig {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

/// Node circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeHealthConfig {
    /// Consecutive I/O failures before a node is taken out of rotation (default: 10).
    pub io_error_threshold: u32,
    /// How long a failed node stays out before a probe is allowed (default: 1000).
    pub recovery_interval_ms: u64,
    /// Successful probes required to put the node back (default: 1).
    pub success_threshold: u32,
}

impl Default for NodeHealthConfig {
    fn default() -> Self {
        Self {
            io_error_threshold: 10,
            recovery_interval_ms: 1000,
            success_threshold: 1,
        }
    }
}

/// Key naming policy applied by the default JSON serializer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    #[default]
    CamelCase,
    PascalCase,
    AsIs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    pub naming: NamingPolicy,
}

/// Load driver configuration from a TOML file.
///
/// A missing file yields the defaults; a file that exists but does not parse is a
/// `Configuration` error.
pub fn load_config(path: impl AsRef<Path>) -> CouchResult<DriverConfig> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let config: DriverConfig = toml::from_str(&content).map_err(|e| {
                CouchError::Configuration(format!("failed to parse {}: {}", path.display(), e))
            })?;
            tracing::info!("Loaded driver config from {}", path.display());
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            Ok(DriverConfig::default())
        }
        Err(e) => Err(CouchError::Configuration(format!(
            "failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}
