use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::GatewayResult;
use crate::job::JobRecord;
use crate::message::{Message, MessageId, NewMessage, OwnerToken};

/// Atomic storage primitives every backend provides.
///
/// Lease-changing calls are conditional updates keyed on
/// `(status, owner_token)`; none of them may be built from a separate read
/// followed by an unconditional write.
#[async_trait]
pub trait StorageGateway: Send + Sync + 'static {
    /// Backend name for logs (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Store a new `Waiting` message. A job message fails with `DuplicateKey`
    /// while the job still has an unconsumed message, or when its slot is
    /// already held by a message not in `Error`.
    async fn insert(&self, message: NewMessage) -> GatewayResult<MessageId>;

    /// Claim the best eligible message for `owner`, or `None` when nothing is
    /// eligible.
    async fn try_claim_next(
        &self,
        routes: &[String],
        owner: &OwnerToken,
        now: DateTime<Utc>,
    ) -> GatewayResult<Option<Message>>;

    /// Renew a lease. `NotFound` once the lease was reclaimed.
    async fn heartbeat(&self, id: MessageId, owner: &OwnerToken, now: DateTime<Utc>)
        -> GatewayResult<()>;

    /// `Processing -> Complete`; already-`Complete` is accepted.
    async fn complete(&self, id: MessageId, owner: &OwnerToken) -> GatewayResult<()>;

    /// `Processing -> Error`, recording `reason` in the headers.
    async fn fail(&self, id: MessageId, owner: &OwnerToken, reason: &str) -> GatewayResult<()>;

    /// `Processing` messages whose last heartbeat is older than `threshold`.
    async fn scan_expired_leases(&self, threshold: DateTime<Utc>) -> GatewayResult<Vec<Message>>;

    /// Reset a scanned lease to `Waiting`. Returns `false` if the message
    /// changed since the scan (renewed, completed or already reset).
    async fn reset_lease(&self, expired: &Message) -> GatewayResult<bool>;

    /// Move a scanned lease to `Error`. Same conditional rules as `reset_lease`.
    async fn mark_error(&self, expired: &Message, reason: &str) -> GatewayResult<bool>;

    /// The one permitted `Error -> Waiting` move. Refused for a job message
    /// whose job already has another unconsumed message.
    async fn requeue_error(&self, id: MessageId) -> GatewayResult<bool>;

    /// Delete `Waiting` messages whose expiry passed. Returns the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> GatewayResult<u64>;

    async fn get(&self, id: MessageId) -> GatewayResult<Option<Message>>;

    /// Number of stored messages produced by job `name`, in any status.
    async fn count_for_job(&self, name: &str) -> GatewayResult<usize>;

    /// Insert or replace a job definition.
    async fn save_job(&self, job: &JobRecord) -> GatewayResult<()>;

    async fn load_jobs(&self) -> GatewayResult<Vec<JobRecord>>;

    /// Tombstone a job. Returns `false` if no active job had that name.
    async fn remove_job(&self, name: &str) -> GatewayResult<bool>;

    async fn record_job_fired(&self, name: &str, slot: DateTime<Utc>) -> GatewayResult<()>;

    /// `(job name, slot)` for every active job due at `now` that has not
    /// fired for that slot yet.
    async fn find_due_job_slots(&self, now: DateTime<Utc>) -> GatewayResult<Vec<(String, DateTime<Utc>)>> {
        let jobs = self.load_jobs().await?;
        let mut due = Vec::new();
        for job in jobs.iter().filter(|j| j.is_active()) {
            let schedule = match job.schedule() {
                Ok(s) => s,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Stored job has an invalid cron expression");
                    continue;
                }
            };
            if let Some(slot) = job.due_slot(&schedule, now) {
                due.push((job.name.clone(), slot));
            }
        }
        Ok(due)
    }
}
