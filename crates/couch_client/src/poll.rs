//! Poll an async call until its result satisfies a condition.

use std::future::Future;
use std::time::{Duration, Instant};

use couch_common::cancel::CancelSignal;
use couch_common::error::{CouchError, CouchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Overall budget across all calls.
    pub timeout: Duration,
    /// Pause between calls.
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2500),
            interval: Duration::from_millis(100),
        }
    }
}

/// Call `call` until `done` accepts its result or the budget runs out.
///
/// Always makes at least one call. When the budget runs out the last
/// observed result is returned as-is; running out is not an error. Errors
/// from `call` end the poll.
pub async fn poll_until<T, F, Fut, D>(
    mut call: F,
    done: D,
    options: PollOptions,
    cancel: &CancelSignal,
) -> CouchResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CouchResult<T>>,
    D: Fn(&T) -> bool,
{
    let deadline = Instant::now() + options.timeout;
    let mut calls = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(CouchError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CouchError::Cancelled),
            result = call() => result?,
        };
        calls += 1;
        if done(&result) {
            return Ok(result);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::debug!(calls, "poll budget exhausted, returning last result");
            return Ok(result);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CouchError::Cancelled),
            _ = tokio::time::sleep(options.interval.min(remaining)) => {}
        }
        if Instant::now() >= deadline {
            tracing::debug!(calls, "poll budget exhausted, returning last result");
            return Ok(result);
        }
    }
}
