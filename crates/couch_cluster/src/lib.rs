pub mod circuit_breaker;
pub mod context;
pub mod key_mapper;
pub mod node;
pub mod topology;
pub mod watcher;

pub use circuit_breaker::{BreakerState, NodeCircuitBreaker};
pub use context::{ConfigContext, TopologyChange, TopologySnapshot};
pub use key_mapper::{KeyMapper, KeyMapperStrategy, KeyTarget, KetamaKeyMapper, VBucketKeyMapper};
pub use node::{Connection, ConnectionPool, Node, NodeConnector, PoolFactory, SaslMechanism};
pub use topology::{parse_bucket_config, BucketConfig, BucketType, NodeLocator, VBucketServerMap};
pub use watcher::{ConfigPublisher, ConfigWatcher, ConfigWatcherHandle};
