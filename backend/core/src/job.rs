use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronSchedule;
use crate::error::Result;

/// A recurring work definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub name: String,
    pub cron_expression: String,
    /// Most recent slot an enqueue already happened for.
    pub last_fired_slot: Option<DateTime<Utc>>,
    pub enqueue_window: Option<Duration>,
    /// True until the first fire after an add/update that carried a window.
    pub window_pending: bool,
    /// When the current definition was added or updated; fire times before
    /// this are only considered through the enqueue window.
    pub armed_at: DateTime<Utc>,
    pub removed: bool,
}

impl JobRecord {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        enqueue_window: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            last_fired_slot: None,
            enqueue_window,
            window_pending: enqueue_window.is_some(),
            armed_at: now,
            removed: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.removed
    }

    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.cron_expression)
    }

    /// The slot this job should fire for at `now`, if any.
    ///
    /// A pending enqueue window looks back `window` once; otherwise only the
    /// current bucket is considered, and never before `armed_at`. A slot
    /// equal to `last_fired_slot` is never returned.
    pub fn due_slot(&self, schedule: &CronSchedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.removed {
            return None;
        }

        let windowed = match (self.window_pending, self.enqueue_window) {
            (true, Some(window)) => chrono::Duration::from_std(window)
                .ok()
                .and_then(|w| schedule.latest_fire_at_or_before(now, w)),
            _ => None,
        };

        let fire_time = windowed.or_else(|| {
            let bucket_start = now.checked_sub_signed(schedule.granularity().unit())?;
            schedule.latest_fire_between(std::cmp::max(bucket_start, self.armed_at), now)
        })?;

        let slot = schedule.slot_of(fire_time);
        (self.last_fired_slot != Some(slot)).then_some(slot)
    }

    pub fn mark_fired(&mut self, slot: DateTime<Utc>) {
        self.last_fired_slot = Some(slot);
        self.window_pending = false;
    }
}
