//! Node circuit breaker takes a misbehaving node out of rotation.
//!
//! State machine: Closed → Open → HalfOpen → Closed
//!
//! - **Closed**: normal dispatch; consecutive I/O failures are counted.
//! - **Open**: the node is considered down; dispatch fails fast with
//!   `NodeUnavailable` so the retry loop can re-resolve.
//! - **HalfOpen**: after `recovery_interval`, one probe dispatch is let through.
//!   - Success → Closed (reset counters)
//!   - Failure → Open (restart timer)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use couch_common::config::NodeHealthConfig;
use couch_common::error::{CouchError, CouchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for a node breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Consecutive probe successes in HalfOpen before closing.
    pub success_threshold: u32,
    /// How long to stay Open before letting a probe through.
    pub recovery_interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&NodeHealthConfig::default())
    }
}

impl From<&NodeHealthConfig> for BreakerConfig {
    fn from(cfg: &NodeHealthConfig) -> Self {
        Self {
            failure_threshold: cfg.io_error_threshold.max(1),
            success_threshold: cfg.success_threshold.max(1),
            recovery_interval: Duration::from_millis(cfg.recovery_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BreakerMetrics {
    pub state: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejected: u64,
    pub state_changes: u64,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    state_changes: u64,
}

pub struct NodeCircuitBreaker {
    node: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejected: AtomicU64,
}

impl NodeCircuitBreaker {
    pub fn new(node: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            node: node.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
                state_changes: 0,
            }),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// A breaker that starts Open, for nodes whose connection could not be built.
    pub fn tripped(node: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self::new(node, config);
        {
            let mut inner = breaker.inner.lock();
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
        breaker
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Returns `Ok(())` if a dispatch may proceed, `Err(NodeUnavailable)` otherwise.
    pub fn check(&self) -> CouchResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_interval)
                    .unwrap_or(true);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    inner.state_changes += 1;
                    tracing::info!(node = %self.node, "circuit breaker: Open → HalfOpen (probe allowed)");
                    metrics::counter!("couch_node_breaker_transitions_total", "to" => "half_open")
                        .increment(1);
                    return Ok(());
                }
                self.reject()
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return self.reject();
                }
                inner.probe_in_flight = true;
                Ok(())
            }
        }
    }

    fn reject(&self) -> CouchResult<()> {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
        Err(CouchError::NodeUnavailable {
            node: self.node.clone(),
        })
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                    inner.state_changes += 1;
                    tracing::info!(node = %self.node, "circuit breaker: HalfOpen → Closed (recovered)");
                    metrics::counter!("couch_node_breaker_transitions_total", "to" => "closed")
                        .increment(1);
                }
            }
            BreakerState::Closed => inner.consecutive_successes += 1,
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.state_changes += 1;
                tracing::warn!(
                    node = %self.node,
                    failures = inner.consecutive_failures,
                    "circuit breaker: Closed → Open (node taken out of rotation)"
                );
                metrics::counter!("couch_node_breaker_transitions_total", "to" => "open")
                    .increment(1);
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.state_changes += 1;
                tracing::warn!(node = %self.node, "circuit breaker: HalfOpen → Open (probe failed)");
            }
            _ => {}
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.lock();
        BreakerMetrics {
            state: inner.state.to_string(),
            consecutive_failures: inner.consecutive_failures,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            state_changes: inner.state_changes,
        }
    }
}
