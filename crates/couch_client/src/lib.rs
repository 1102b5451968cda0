pub mod bucket;
pub mod executor;
pub mod operation;
pub mod poll;
pub mod retry;

pub use bucket::{Bucket, IncrementOptions, OperationSender};
pub use executor::{OperationResult, RequestExecutor};
pub use operation::{ConcatMode, CounterMode, Operation, OperationKind, StoreMode};
pub use poll::{poll_until, PollOptions};
pub use retry::{RetryDecision, RetryPolicy};
