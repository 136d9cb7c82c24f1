//! Cron evaluation and slot bucketing.
//!
//! Accepts 5-field (min hour dom mon dow), 6-field (sec ...) and 7-field
//! (sec ... year) expressions in the `cron` crate dialect. A 5-field
//! expression gets a `0` seconds field.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::error::{QueueError, Result};

/// Width of the time bucket a job's "already fired" state is tracked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotGranularity {
    Second,
    Minute,
}

impl SlotGranularity {
    pub fn unit(&self) -> Duration {
        match self {
            SlotGranularity::Second => Duration::seconds(1),
            SlotGranularity::Minute => Duration::minutes(1),
        }
    }

    /// Truncate `at` to the start of its bucket.
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.unit().num_seconds();
        let secs = at.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).unwrap_or(at)
    }
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    granularity: SlotGranularity,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!("0 {}", fields.join(" ")),
            6 | 7 => fields.join(" "),
            n => {
                return Err(QueueError::InvalidCron {
                    expression: expression.to_string(),
                    reason: format!("expected 5, 6 or 7 fields, got {}", n),
                })
            }
        };

        let schedule = Schedule::from_str(&normalized).map_err(|e| QueueError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        // A single literal seconds value means the finest varying field is
        // the minute.
        let seconds_field = normalized.split_whitespace().next().unwrap_or("*");
        let granularity = if seconds_field.chars().all(|c| c.is_ascii_digit()) {
            SlotGranularity::Minute
        } else {
            SlotGranularity::Second
        };

        Ok(Self {
            expression: expression.to_string(),
            schedule,
            granularity,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn granularity(&self) -> SlotGranularity {
        self.granularity
    }

    pub fn slot_of(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.granularity.truncate(at)
    }

    /// Most recent fire time in `(since, now]`.
    pub fn latest_fire_between(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if since >= now {
            return None;
        }
        self.schedule
            .after(&since)
            .take_while(|t| *t <= now)
            .last()
    }

    /// Most recent fire time no older than `lookback`. A lookback reaching
    /// past the representable range finds nothing.
    pub fn latest_fire_at_or_before(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> Option<DateTime<Utc>> {
        let since = now.checked_sub_signed(lookback)?;
        self.latest_fire_between(since, now)
    }

    /// Slot of the current bucket if the schedule fires inside it.
    pub fn due_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.latest_fire_at_or_before(now, self.granularity.unit())
            .map(|t| self.slot_of(t))
    }

    pub fn next_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&at).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn five_field_expression_is_minute_granular() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(schedule.granularity(), SlotGranularity::Minute);
        assert_eq!(schedule.slot_of(at(12, 5, 42)), at(12, 5, 0));
    }

    #[test]
    fn varying_seconds_field_is_second_granular() {
        let schedule = CronSchedule::parse("*/5 * * * * *").unwrap();
        assert_eq!(schedule.granularity(), SlotGranularity::Second);

        let literal = CronSchedule::parse("30 * * * * *").unwrap();
        assert_eq!(literal.granularity(), SlotGranularity::Minute);
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronSchedule::parse("* * *").unwrap_err();
        assert!(matches!(err, QueueError::InvalidCron { .. }));
    }

    #[test]
    fn due_slot_only_within_current_bucket() {
        let schedule = CronSchedule::parse("0 */5 * * * *").unwrap();
        assert_eq!(schedule.due_slot(at(12, 5, 30)), Some(at(12, 5, 0)));
        assert_eq!(schedule.due_slot(at(12, 6, 30)), None);
    }

    #[test]
    fn oversized_lookback_finds_nothing() {
        let schedule = CronSchedule::parse("0 * * * * *").unwrap();
        assert_eq!(
            schedule.latest_fire_at_or_before(at(12, 0, 10), Duration::MAX),
            None
        );
    }

    #[test]
    fn lookback_finds_recent_fire() {
        let schedule = CronSchedule::parse("0 * * * * *").unwrap();
        let now = at(12, 0, 10);
        assert_eq!(
            schedule.latest_fire_at_or_before(now, Duration::seconds(40)),
            Some(at(12, 0, 0))
        );
        assert_eq!(
            schedule.latest_fire_at_or_before(now, Duration::seconds(5)),
            None
        );
    }
}
