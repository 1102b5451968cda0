pub mod cancel;
pub mod config;
pub mod error;
pub mod types;

pub use cancel::CancelSignal;
pub use config::{load_config, DriverConfig};
pub use error::{CouchError, CouchResult, ErrorKind, ProtocolError};
pub use types::{Opaque, PartitionId, Revision};
