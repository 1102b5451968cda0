//! Single background refresher for a `ConfigContext`.
//!
//! Topology documents arrive from any number of producers (streaming config
//! endpoint, not-my-partition responses) and are applied one at a time by a
//! single task, so `load_topology` never runs concurrently.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use couch_common::error::{CouchError, CouchResult};

use crate::context::{ConfigContext, TopologyChange};
use crate::topology::BucketConfig;

const QUEUE_DEPTH: usize = 64;

/// Hands topology documents to whoever applies them.
#[async_trait]
pub trait ConfigPublisher: Send + Sync {
    /// Apply `config` and wait for the outcome.
    async fn publish(&self, config: BucketConfig) -> CouchResult<TopologyChange>;
}

type Ack = oneshot::Sender<CouchResult<TopologyChange>>;

struct Submission {
    config: BucketConfig,
    ack: Option<Ack>,
}

pub struct ConfigWatcher;

impl ConfigWatcher {
    /// Start the refresher task for `context`.
    pub fn spawn(context: Arc<ConfigContext>) -> ConfigWatcherHandle {
        let (tx, mut rx) = mpsc::channel::<Submission>(QUEUE_DEPTH);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let bucket = context.bucket().to_string();

        let task = tokio::spawn(async move {
            tracing::debug!(bucket = %bucket, "config watcher started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    submission = rx.recv() => {
                        let Some(Submission { config, ack }) = submission else { break };
                        let rev = config.rev;
                        let result = context.load_topology(config).await;
                        if let Err(e) = &result {
                            tracing::warn!(bucket = %bucket, rev, error = %e, "topology rejected");
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(result);
                        }
                    }
                }
            }
            tracing::debug!(bucket = %bucket, "config watcher stopped");
        });

        ConfigWatcherHandle {
            tx,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(parking_lot::Mutex::new(Some(task))),
        }
    }
}

#[derive(Clone)]
pub struct ConfigWatcherHandle {
    tx: mpsc::Sender<Submission>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl ConfigWatcherHandle {
    fn stopped() -> CouchError {
        CouchError::Internal("config watcher is not running".into())
    }

    /// Queue `config` without waiting for it to be applied.
    pub fn submit(&self, config: BucketConfig) -> CouchResult<()> {
        self.tx
            .try_send(Submission { config, ack: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    CouchError::Internal("config watcher queue is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => Self::stopped(),
            })
    }

    /// Queue `config` and wait until it has been applied.
    pub async fn refresh(&self, config: BucketConfig) -> CouchResult<TopologyChange> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Submission {
                config,
                ack: Some(ack),
            })
            .await
            .map_err(|_| Self::stopped())?;
        done.await.map_err(|_| Self::stopped())?
    }

    /// Stop the refresher and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[async_trait]
impl ConfigPublisher for ConfigWatcherHandle {
    async fn publish(&self, config: BucketConfig) -> CouchResult<TopologyChange> {
        self.refresh(config).await
    }
}

/// Applies documents directly, for callers that already serialize loads.
#[async_trait]
impl ConfigPublisher for ConfigContext {
    async fn publish(&self, config: BucketConfig) -> CouchResult<TopologyChange> {
        self.load_topology(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::TestFactory;
    use crate::node::NodeConnector;
    use crate::topology::tests::vbucket_doc;
    use couch_common::config::TopologyConfig;
    use couch_common::types::Revision;

    fn context() -> Arc<ConfigContext> {
        let connector = Arc::new(NodeConnector::new(Arc::new(TestFactory::default()), "default"));
        Arc::new(ConfigContext::new(connector, &TopologyConfig::default()))
    }

    #[tokio::test]
    async fn test_refresh_waits_for_load() {
        let ctx = context();
        let handle = ConfigWatcher::spawn(ctx.clone());
        let change = handle
            .refresh(vbucket_doc(3, &["a:11210"], vec![vec![0]; 4]))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::Initial);
        assert_eq!(ctx.revision(), Some(Revision(3)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_submissions_applied_in_order() {
        let ctx = context();
        let handle = ConfigWatcher::spawn(ctx.clone());
        for rev in 1..=5 {
            handle
                .submit(vbucket_doc(rev, &["a:11210"], vec![vec![0]; 4]))
                .unwrap();
        }
        // A waited refresh queues behind the fire-and-forget ones.
        let change = handle
            .publish(vbucket_doc(5, &["a:11210"], vec![vec![0]; 4]))
            .await
            .unwrap();
        assert_eq!(change, TopologyChange::Unchanged);
        assert_eq!(ctx.revision(), Some(Revision(5)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_document_reports_error() {
        let handle = ConfigWatcher::spawn(context());
        let mut doc = vbucket_doc(1, &["a:11210"], vec![vec![0]; 4]);
        doc.vbucket_server_map = None;
        let err = handle.refresh(doc).await.unwrap_err();
        assert!(matches!(err, CouchError::Configuration(_)));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_watcher_refuses_work() {
        let handle = ConfigWatcher::spawn(context());
        handle.shutdown().await;
        let err = handle
            .refresh(vbucket_doc(1, &["a:11210"], vec![vec![0]; 4]))
            .await
            .unwrap_err();
        assert!(matches!(err, CouchError::Internal(_)));
    }
}
