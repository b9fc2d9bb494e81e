//! Decouples pushes from change detection.
//!
//! Watchers hand each update to the [`Dispatcher`], which queues it for one of
//! a fixed set of workers. An application's updates always land on the same
//! worker, so they are delivered in order. Each worker publishes an update to
//! every protocol engine in turn.

use crate::PushError;
use ahash::RandomState;
use std::sync::Arc;
use strategy_controller_core::{Rule, SubscribeTarget};
use strategy_controller_k8s_index::PushRules;
use tokio::sync::mpsc;
use tracing::{debug, info_span, warn, Instrument};

/// Delivers an application's rules to the clients of one protocol.
#[async_trait::async_trait]
pub trait Publish: Send + Sync + 'static {
    async fn publish(
        &self,
        target: &SubscribeTarget,
        rules: &[Rule],
        version: i64,
    ) -> Result<(), PushError>;
}

#[derive(Clone, Debug)]
pub struct Dispatcher {
    queues: Arc<[mpsc::Sender<Job>]>,
    hasher: RandomState,
}

/// The receiving ends of the dispatcher's queues.
#[derive(Debug)]
pub struct Workers(Vec<mpsc::Receiver<Job>>);

#[derive(Debug)]
struct Job {
    target: SubscribeTarget,
    rules: Vec<Rule>,
    version: i64,
}

// === impl Dispatcher ===

impl Dispatcher {
    /// Creates a dispatcher with `workers` queues of `capacity` jobs each.
    pub fn new(workers: usize, capacity: usize) -> (Self, Workers) {
        let (queues, rxs): (Vec<_>, Vec<_>) = (0..workers.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();
        let dispatcher = Self {
            queues: queues.into(),
            hasher: RandomState::new(),
        };
        (dispatcher, Workers(rxs))
    }

    fn queue(&self, target: &SubscribeTarget) -> &mpsc::Sender<Job> {
        let hash = self
            .hasher
            .hash_one((&target.namespace, &target.app)) as usize;
        &self.queues[hash % self.queues.len()]
    }
}

#[async_trait::async_trait]
impl PushRules for Dispatcher {
    async fn push(
        &self,
        target: SubscribeTarget,
        rules: Vec<Rule>,
        version: i64,
    ) -> anyhow::Result<()> {
        let job = Job {
            target,
            rules,
            version,
        };
        self.queue(&job.target)
            .send(job)
            .await
            .map_err(|_| anyhow::anyhow!("push workers have stopped"))
    }
}

// === impl Workers ===

impl Workers {
    /// Spawns a task per queue that publishes each job to every engine.
    ///
    /// Workers run until every [`Dispatcher`] handle is dropped.
    pub fn spawn(self, engines: Vec<Arc<dyn Publish>>) -> Vec<tokio::task::JoinHandle<()>> {
        let engines: Arc<[Arc<dyn Publish>]> = engines.into();
        self.0
            .into_iter()
            .enumerate()
            .map(|(id, rx)| {
                tokio::spawn(
                    run(rx, engines.clone()).instrument(info_span!("push", worker = id)),
                )
            })
            .collect()
    }
}

async fn run(mut rx: mpsc::Receiver<Job>, engines: Arc<[Arc<dyn Publish>]>) {
    while let Some(Job {
        target,
        rules,
        version,
    }) = rx.recv().await
    {
        for engine in engines.iter() {
            match engine.publish(&target, &rules, version).await {
                Ok(()) => {}
                Err(error) if error.is_no_connections() => {
                    debug!(%target, version, "No connections for kind");
                }
                Err(error) => warn!(%error, %target, version, "Failed to push rules"),
            }
        }
    }
    debug!("Dispatcher closed");
}
