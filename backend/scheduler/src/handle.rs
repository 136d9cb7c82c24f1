use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use queueforge_core::{GatewayError, NewMessage, Result};

/// Context handed to a payload factory when a job fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFire {
    pub job: String,
    pub slot: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}

/// Builds the message enqueued for one firing. The scheduler tags it with the
/// job slot afterwards; an error is reported as a queue exception and the
/// slot is retried on the next tick.
pub type PayloadFactory = Arc<dyn Fn(&JobFire) -> Result<NewMessage> + Send + Sync>;

/// JSON-encoded `JobFire` as payload.
pub fn json_payload(fire: &JobFire) -> Result<NewMessage> {
    let payload = serde_json::to_vec(fire).map_err(GatewayError::from)?;
    Ok(NewMessage::new(payload))
}

/// Returned by `JobScheduler::add_update_job`.
#[derive(Debug, Clone)]
pub struct JobHandle {
    name: String,
    stopped: Arc<AtomicBool>,
}

impl JobHandle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop firing this job in this process. The job record stays scheduled;
    /// use `JobScheduler::remove_job` to delete it.
    pub fn stop_schedule(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
