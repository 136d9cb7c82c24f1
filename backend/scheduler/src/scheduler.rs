use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use queueforge_core::{
    Clock, CronSchedule, GatewayError, JobRecord, NewMessage, QueueConfig, QueueError, Result,
    SchedulerEvent, Shutdown, StorageGateway,
};

use crate::handle::{JobFire, JobHandle, PayloadFactory};

/// Per-process state of a job added through this scheduler.
struct LocalJob {
    factory: PayloadFactory,
    handle: JobHandle,
    last_fired_slot: Option<DateTime<Utc>>,
}

/// Evaluates persisted jobs against the clock and enqueues one message per
/// job per due slot.
///
/// Several schedulers may share one gateway; the gateway's uniqueness on
/// `(job, slot)` makes a concurrent second enqueue surface as
/// `JobNonFatalFailure` instead of a second message.
pub struct JobScheduler {
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    jobs: Mutex<HashMap<String, LocalJob>>,
    events: broadcast::Sender<SchedulerEvent>,
    tick_interval: Duration,
    shutdown: Shutdown,
    started: AtomicBool,
}

impl JobScheduler {
    pub fn new(gateway: Arc<dyn StorageGateway>, clock: Arc<dyn Clock>, config: &QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer_size.max(1));
        Self {
            gateway,
            clock,
            jobs: Mutex::new(HashMap::new()),
            events,
            tick_interval: config.scheduler_tick(),
            shutdown: Shutdown::new(),
            started: AtomicBool::new(false),
        }
    }

    fn local(&self) -> MutexGuard<'_, HashMap<String, LocalJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Listen for scheduler events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Add a job, or replace the definition of an existing one.
    ///
    /// With `enqueue_window`, a fire time that passed less than `window` ago
    /// is enqueued on the next tick instead of waiting for the next slot.
    pub async fn add_update_job<F>(
        &self,
        name: &str,
        cron_expression: &str,
        factory: F,
        enqueue_window: Option<Duration>,
    ) -> Result<JobHandle>
    where
        F: Fn(&JobFire) -> Result<NewMessage> + Send + Sync + 'static,
    {
        if name.trim().is_empty() {
            return Err(QueueError::ConfigError("job name must not be empty".into()));
        }
        let schedule = CronSchedule::parse(cron_expression)?;

        let previous = self
            .gateway
            .load_jobs()
            .await?
            .into_iter()
            .find(|j| j.name == name);
        let mut record = JobRecord::new(name, cron_expression, enqueue_window, self.clock.now());
        record.last_fired_slot = previous.and_then(|p| p.last_fired_slot);
        self.gateway.save_job(&record).await?;

        let handle = JobHandle::new(name);
        let replaced = self.local().insert(
            name.to_string(),
            LocalJob {
                factory: Arc::new(factory),
                handle: handle.clone(),
                last_fired_slot: record.last_fired_slot,
            },
        );
        if let Some(old) = replaced {
            old.handle.stop_schedule();
        }

        info!(
            job = %name,
            cron = %cron_expression,
            granularity = ?schedule.granularity(),
            window_secs = enqueue_window.map(|w| w.as_secs()),
            next = ?schedule.next_after(self.clock.now()),
            "Job scheduled"
        );
        Ok(handle)
    }

    /// Stop evaluating `name`. Messages already enqueued for it are left alone.
    pub async fn remove_job(&self, name: &str) -> Result<bool> {
        if let Some(local) = self.local().remove(name) {
            local.handle.stop_schedule();
        }
        let removed = self.gateway.remove_job(name).await?;
        if removed {
            info!(job = %name, "Job removed");
        }
        Ok(removed)
    }

    /// Active jobs as persisted.
    pub async fn jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self
            .gateway
            .load_jobs()
            .await?
            .into_iter()
            .filter(JobRecord::is_active)
            .collect())
    }

    /// One evaluation pass. Returns the number of messages enqueued.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.gateway.find_due_job_slots(now).await?;

        let mut queued = 0;
        for (name, slot) in due {
            let factory = {
                let jobs = self.local();
                match jobs.get(&name) {
                    Some(job) if !job.handle.is_stopped() && job.last_fired_slot != Some(slot) => {
                        job.factory.clone()
                    }
                    _ => continue,
                }
            };

            let fire = JobFire {
                job: name.clone(),
                slot,
                fired_at: now,
            };
            let message = match factory(&fire) {
                Ok(message) => message.for_job(name.as_str(), slot),
                Err(e) => {
                    error!(job = %name, slot = %slot, error = %e, "Payload factory failed");
                    self.emit(SchedulerEvent::JobQueueException {
                        job: name,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self.gateway.insert(message).await {
                Ok(message_id) => {
                    self.mark_local(&name, slot);
                    if let Err(e) = self.gateway.record_job_fired(&name, slot).await {
                        warn!(job = %name, error = %e, "Failed to persist fired slot");
                    }
                    info!(job = %name, slot = %slot, message_id = %message_id, "Job enqueued");
                    self.emit(SchedulerEvent::JobQueued {
                        job: name,
                        slot,
                        message_id,
                    });
                    queued += 1;
                }
                Err(GatewayError::DuplicateKey(key)) => {
                    self.mark_local(&name, slot);
                    debug!(job = %name, key = %key, "Slot already enqueued");
                    self.emit(SchedulerEvent::JobNonFatalFailure {
                        job: name,
                        info: format!("message for {} already enqueued", key),
                    });
                }
                Err(e) => {
                    error!(job = %name, slot = %slot, error = %e, "Failed to enqueue job");
                    self.emit(SchedulerEvent::JobQueueException {
                        job: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(queued)
    }

    fn mark_local(&self, name: &str, slot: DateTime<Utc>) {
        if let Some(job) = self.local().get_mut(name) {
            job.last_fired_slot = Some(slot);
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run `tick` every scheduler interval until `stop`. Jobs may be added
    /// before or after starting.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::ConfigError("job scheduler already started".into()));
        }

        let scheduler = self.clone();
        let token = self.shutdown.token();
        self.shutdown.track(tokio::spawn(async move {
            let mut ticker = time::interval(scheduler.tick_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if token.is_cancelled() {
                    break;
                }
                if let Err(e) = scheduler.tick().await {
                    warn!(error = %e, "Scheduler tick failed; retrying next tick");
                }
            }
            debug!("Scheduler loop stopped");
        }));

        info!(tick_ms = self.tick_interval.as_millis() as u64, "Job scheduler started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.stop().await;
        info!("Job scheduler stopped");
    }
}
