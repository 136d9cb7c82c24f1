//! Worker pool driver: claim, dispatch, settle.
//!
//! Each worker loops over `claim -> handle -> commit/fail`. The handler runs
//! under the lease's cancellation token; when the heartbeat monitor finds the
//! lease lost, the handler is abandoned without settling the message.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use queueforge_core::{
    Clock, Message, QueueConfig, QueueError, Result, Shutdown, StorageGateway,
};

use crate::backoff::{BackoffPolicy, PollBackoff};
use crate::coordinator::LeaseCoordinator;
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, LeaseRegistry};

/// User code that processes one message.
///
/// `cancel` fires when the lease is lost; side effects already made must be
/// idempotent because the message will be delivered again.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message, cancel: CancellationToken) -> anyhow::Result<()>;
}

pub struct WorkerPool {
    coordinator: Arc<LeaseCoordinator>,
    monitor: Arc<HeartbeatMonitor>,
    registry: LeaseRegistry,
    routes: Arc<Vec<String>>,
    worker_count: usize,
    backoff: BackoffPolicy,
    workers: Shutdown,
    background: Shutdown,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(gateway: Arc<dyn StorageGateway>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(LeaseCoordinator::new(gateway, clock));
        let registry = LeaseRegistry::new();
        let monitor = Arc::new(HeartbeatMonitor::new(
            coordinator.clone(),
            registry.clone(),
            HeartbeatConfig::from(config),
        ));
        Ok(Self {
            coordinator,
            monitor,
            registry,
            routes: Arc::new(config.routes.clone()),
            worker_count: config.worker_count,
            backoff: BackoffPolicy::from(config),
            workers: Shutdown::new(),
            background: Shutdown::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn coordinator(&self) -> &Arc<LeaseCoordinator> {
        &self.coordinator
    }

    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Number of messages being handled right now.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Start the workers and the heartbeat monitor. A pool runs once.
    pub fn start(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Other(anyhow!("worker pool already started")));
        }

        for index in 0..self.worker_count {
            let worker = Worker {
                index,
                coordinator: self.coordinator.clone(),
                registry: self.registry.clone(),
                routes: self.routes.clone(),
                handler: handler.clone(),
                backoff: PollBackoff::new(self.backoff.clone()),
            };
            self.workers.track(tokio::spawn(worker.run(self.workers.token())));
        }
        self.monitor.spawn(&self.background);

        info!(
            workers = self.worker_count,
            routes = ?self.routes,
            owner = %self.coordinator.owner(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop claiming, let in-flight handlers finish, then stop the monitor.
    /// Leases keep being renewed until the last handler returns.
    pub async fn stop(&self) {
        self.workers.stop().await;
        self.background.stop().await;
        info!(owner = %self.coordinator.owner(), "Worker pool stopped");
    }
}

struct Worker {
    index: usize,
    coordinator: Arc<LeaseCoordinator>,
    registry: LeaseRegistry,
    routes: Arc<Vec<String>>,
    handler: Arc<dyn MessageHandler>,
    backoff: PollBackoff,
}

impl Worker {
    async fn run(mut self, token: CancellationToken) {
        debug!(worker = self.index, "Worker started");
        loop {
            if token.is_cancelled() {
                break;
            }
            let delay = match self.coordinator.claim(&self.routes).await {
                Ok(Some(msg)) => {
                    self.backoff.reset();
                    self.process(msg).await;
                    continue;
                }
                Ok(None) => self.backoff.next_delay(),
                Err(e) => {
                    warn!(worker = self.index, error = %e, "Claim failed");
                    self.backoff.next_delay()
                }
            };
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(worker = self.index, "Worker stopped");
    }

    async fn process(&self, msg: Message) {
        let id = msg.id;
        let Some(lease) = msg.lease() else {
            error!(worker = self.index, message_id = %id, "Claimed message carries no lease");
            return;
        };
        let cancel = self.registry.register(&lease);

        let outcome = tokio::select! {
            result = self.handler.handle(&msg, cancel.clone()) => Some(result),
            _ = cancel.cancelled() => None,
        };
        self.registry.release(&lease);

        let settled = match outcome {
            None => {
                warn!(worker = self.index, message_id = %id, "Lease lost; abandoning message");
                return;
            }
            Some(Ok(())) => self.coordinator.commit(&lease).await,
            Some(Err(e)) => self.coordinator.fail(&lease, &format!("{:#}", e)).await,
        };

        match settled {
            Ok(()) => {}
            Err(QueueError::NotOwned(_)) => {
                warn!(worker = self.index, message_id = %id, "Lease lost before settle; result dropped");
            }
            Err(e) => {
                error!(worker = self.index, message_id = %id, error = %e, "Failed to settle message");
            }
        }
    }
}
