//! Heartbeat monitor: local lease renewal, global expired-lease recovery and
//! expired-message purge.
//!
//! Each duty runs on its own interval and is safe to run from every process.
//! A failed pass is logged and retried on the next tick.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use queueforge_core::{
    Lease, MessageId, QueueConfig, Result, Shutdown, LEASE_EXPIRED_TOO_MANY_TIMES,
};

use crate::coordinator::{LeaseCoordinator, RenewOutcome};

// ---------------------------------------------------------------------------
// Lease registry
// ---------------------------------------------------------------------------

/// Leases currently held by workers in this process, each with the token
/// that cancels its handler. Keyed by lease, so a stale claim and the
/// re-claim that replaced it never share an entry.
#[derive(Debug, Clone, Default)]
pub struct LeaseRegistry {
    inner: Arc<Mutex<HashMap<Lease, CancellationToken>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Lease, CancellationToken>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, lease: &Lease) -> CancellationToken {
        let token = CancellationToken::new();
        self.entries().insert(lease.clone(), token.clone());
        token
    }

    /// Drop `lease` without cancelling it. Other leases on the same message
    /// are left alone.
    pub fn release(&self, lease: &Lease) -> bool {
        self.entries().remove(lease).is_some()
    }

    /// Cancel the handler holding `lease`. Returns `false` if it was not
    /// registered.
    pub fn cancel(&self, lease: &Lease) -> bool {
        match self.entries().remove(lease) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn leases(&self) -> Vec<Lease> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// How often locally held leases are renewed.
    pub renew_interval: Duration,
    /// Lease age after which another process may reclaim it.
    pub expiration_threshold: Duration,
    pub scan_interval: Duration,
    pub purge_interval: Duration,
    /// Lease expiries tolerated before the message is poisoned.
    pub max_retries: u32,
}

impl From<&QueueConfig> for HeartbeatConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            renew_interval: config.heartbeat_interval(),
            expiration_threshold: config.heartbeat_timeout(),
            scan_interval: config.recovery_scan_interval(),
            purge_interval: config.expired_purge_interval(),
            max_retries: config.max_retries,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// Outcome of one recovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Leases returned to `Waiting`.
    pub reset: usize,
    /// Leases moved to `Error` after too many expiries.
    pub poisoned: usize,
    /// Leases that changed after the scan (renewed or settled elsewhere).
    pub skipped: usize,
}

pub struct HeartbeatMonitor {
    coordinator: Arc<LeaseCoordinator>,
    registry: LeaseRegistry,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(coordinator: Arc<LeaseCoordinator>, registry: LeaseRegistry, config: HeartbeatConfig) -> Self {
        Self {
            coordinator,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Renew every lease held in this process. Leases found lost have their
    /// handlers cancelled. Returns the number of lost leases.
    pub async fn renew_local(&self) -> usize {
        let mut lost = 0;
        for lease in self.registry.leases() {
            match self.coordinator.renew(&lease).await {
                Ok(RenewOutcome::Renewed) => {}
                Ok(RenewOutcome::Lost) => {
                    if self.registry.cancel(&lease) {
                        lost += 1;
                    }
                }
                Err(e) => {
                    warn!(message_id = %lease.id, error = %e, "Lease renewal failed; retrying next tick");
                }
            }
        }
        lost
    }

    /// Reset or poison every lease whose heartbeat is older than the
    /// expiration threshold.
    pub async fn recover_expired(&self) -> Result<RecoveryReport> {
        let gateway = self.coordinator.gateway();
        let threshold = chrono::Duration::from_std(self.config.expiration_threshold)
            .map_err(|e| anyhow::anyhow!("expiration threshold out of range: {}", e))?;
        let cutoff = self.coordinator.clock().now() - threshold;

        let mut report = RecoveryReport::default();
        for msg in gateway.scan_expired_leases(cutoff).await? {
            if msg.retry_count + 1 >= self.config.max_retries {
                if gateway.mark_error(&msg, LEASE_EXPIRED_TOO_MANY_TIMES).await? {
                    warn!(
                        message_id = %msg.id,
                        retry_count = msg.retry_count + 1,
                        "Lease expired too many times; message moved to error"
                    );
                    report.poisoned += 1;
                } else {
                    report.skipped += 1;
                }
            } else if gateway.reset_lease(&msg).await? {
                info!(
                    message_id = %msg.id,
                    previous_owner = ?msg.owner_token,
                    retry_count = msg.retry_count + 1,
                    "Expired lease reset to waiting"
                );
                report.reset += 1;
            } else {
                debug!(message_id = %msg.id, "Lease changed since scan; skipped");
                report.skipped += 1;
            }
        }
        Ok(report)
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let now = self.coordinator.clock().now();
        Ok(self.coordinator.gateway().purge_expired(now).await?)
    }

    /// Return an errored message to `Waiting`. Allowed once per message, and
    /// never for messages poisoned by lease recovery.
    pub async fn requeue_error(&self, id: MessageId) -> Result<bool> {
        let requeued = self.coordinator.gateway().requeue_error(id).await?;
        if requeued {
            info!(message_id = %id, "Errored message requeued");
        } else {
            debug!(message_id = %id, "Requeue refused");
        }
        Ok(requeued)
    }

    /// Run the three duties on `shutdown`'s token until it is cancelled.
    pub fn spawn(self: &Arc<Self>, shutdown: &Shutdown) {
        let monitor = self.clone();
        shutdown.track(tokio::spawn(run_periodic(
            "renew",
            self.config.renew_interval,
            shutdown.token(),
            move || {
                let monitor = monitor.clone();
                async move {
                    monitor.renew_local().await;
                }
            },
        )));

        let monitor = self.clone();
        shutdown.track(tokio::spawn(run_periodic(
            "recovery",
            self.config.scan_interval,
            shutdown.token(),
            move || {
                let monitor = monitor.clone();
                async move {
                    match monitor.recover_expired().await {
                        Ok(report) if report != RecoveryReport::default() => {
                            info!(
                                reset = report.reset,
                                poisoned = report.poisoned,
                                skipped = report.skipped,
                                "Recovery scan finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Recovery scan failed; retrying next tick"),
                    }
                }
            },
        )));

        let monitor = self.clone();
        shutdown.track(tokio::spawn(run_periodic(
            "purge",
            self.config.purge_interval,
            shutdown.token(),
            move || {
                let monitor = monitor.clone();
                async move {
                    if let Err(e) = monitor.purge_expired().await {
                        warn!(error = %e, "Expired message purge failed; retrying next tick");
                    }
                }
            },
        )));

        info!(
            renew_ms = self.config.renew_interval.as_millis() as u64,
            scan_ms = self.config.scan_interval.as_millis() as u64,
            "Heartbeat monitor started"
        );
    }
}

/// Tick `pass` every `period` until `token` is cancelled. Cancellation is
/// only observed between passes.
async fn run_periodic<F, Fut>(duty: &'static str, period: Duration, token: CancellationToken, mut pass: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let mut ticker = time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if token.is_cancelled() {
            break;
        }
        pass().await;
    }
    debug!(duty, "Heartbeat duty stopped");
}
