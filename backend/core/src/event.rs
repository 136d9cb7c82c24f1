use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageId;

/// Outcome of one job firing attempt, published by the job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// The job's message was enqueued for `slot`.
    JobQueued {
        job: String,
        slot: DateTime<Utc>,
        message_id: MessageId,
    },
    /// Unexpected insert failure; the job stays eligible for the slot.
    JobQueueException { job: String, error: String },
    /// Expected, benign failure such as a slot already enqueued elsewhere.
    JobNonFatalFailure { job: String, info: String },
}

impl SchedulerEvent {
    pub fn job(&self) -> &str {
        match self {
            SchedulerEvent::JobQueued { job, .. }
            | SchedulerEvent::JobQueueException { job, .. }
            | SchedulerEvent::JobNonFatalFailure { job, .. } => job,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::JobQueued { .. } => "job_queued",
            SchedulerEvent::JobQueueException { .. } => "job_queue_exception",
            SchedulerEvent::JobNonFatalFailure { .. } => "job_non_fatal_failure",
        }
    }
}

impl std::fmt::Display for SchedulerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind(), self.job())
    }
}
