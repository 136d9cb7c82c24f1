//! In-process key-value gateway.
//!
//! All state lives behind one mutex; each call is a single critical section,
//! which gives every conditional update compare-and-swap semantics.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use queueforge_core::{
    GatewayError, GatewayResult, JobRecord, Message, MessageId, MessageStatus, NewMessage,
    OwnerToken, StorageGateway,
};

#[derive(Default)]
struct Inner {
    messages: HashMap<MessageId, Message>,
    jobs: BTreeMap<String, JobRecord>,
    next_sequence: u64,
}

#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> GatewayResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| GatewayError::Unavailable("memory gateway lock poisoned".into()))
    }

    /// Number of stored messages in `status`.
    pub fn count_with_status(&self, status: MessageStatus) -> GatewayResult<usize> {
        Ok(self
            .lock()?
            .messages
            .values()
            .filter(|m| m.status == status)
            .count())
    }

    /// Replace a stored message verbatim; used to stage recovery scenarios.
    pub fn overwrite(&self, message: Message) -> GatewayResult<()> {
        self.lock()?.messages.insert(message.id, message);
        Ok(())
    }
}

/// Shared conditional-update check for a scanned lease.
fn lease_unchanged(current: &Message, expired: &Message) -> bool {
    current.status == MessageStatus::Processing
        && current.owner_token == expired.owner_token
        && current.last_heartbeat == expired.last_heartbeat
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, message: NewMessage) -> GatewayResult<MessageId> {
        let mut inner = self.lock()?;
        if let Some(key) = &message.job {
            if inner.messages.values().any(|m| m.blocks_job_slot(key)) {
                return Err(GatewayError::DuplicateKey(key.to_string()));
            }
        }
        inner.next_sequence += 1;
        let msg = message.into_message(inner.next_sequence, Utc::now());
        let id = msg.id;
        inner.messages.insert(id, msg);
        Ok(id)
    }

    async fn try_claim_next(
        &self,
        routes: &[String],
        owner: &OwnerToken,
        now: DateTime<Utc>,
    ) -> GatewayResult<Option<Message>> {
        let mut inner = self.lock()?;
        let Some(id) = inner
            .messages
            .values()
            .filter(|m| m.is_claimable(now, routes))
            .min_by_key(|m| m.claim_key())
            .map(|m| m.id)
        else {
            return Ok(None);
        };
        let Some(msg) = inner.messages.get_mut(&id) else {
            return Ok(None);
        };
        msg.begin_lease(owner, now);
        Ok(Some(msg.clone()))
    }

    async fn heartbeat(&self, id: MessageId, owner: &OwnerToken, now: DateTime<Utc>) -> GatewayResult<()> {
        let mut inner = self.lock()?;
        let msg = inner
            .messages
            .get_mut(&id)
            .filter(|m| m.status == MessageStatus::Processing)
            .ok_or(GatewayError::NotFound(id))?;
        if !msg.is_owned_by(owner) {
            return Err(GatewayError::NotOwned(id));
        }
        msg.last_heartbeat = Some(now);
        Ok(())
    }

    async fn complete(&self, id: MessageId, owner: &OwnerToken) -> GatewayResult<()> {
        let mut inner = self.lock()?;
        let msg = inner.messages.get_mut(&id).ok_or(GatewayError::NotFound(id))?;
        match msg.status {
            status if status.is_terminal() => Ok(()),
            MessageStatus::Processing if msg.is_owned_by(owner) => {
                msg.complete();
                Ok(())
            }
            _ => Err(GatewayError::NotOwned(id)),
        }
    }

    async fn fail(&self, id: MessageId, owner: &OwnerToken, reason: &str) -> GatewayResult<()> {
        let mut inner = self.lock()?;
        let msg = inner.messages.get_mut(&id).ok_or(GatewayError::NotFound(id))?;
        if !msg.status.can_transition_to(MessageStatus::Error) || !msg.is_owned_by(owner) {
            return Err(GatewayError::NotOwned(id));
        }
        msg.fail(reason);
        Ok(())
    }

    async fn scan_expired_leases(&self, threshold: DateTime<Utc>) -> GatewayResult<Vec<Message>> {
        let inner = self.lock()?;
        let mut expired: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.lease_expired(threshold))
            .cloned()
            .collect();
        expired.sort_by_key(|m| m.sequence);
        Ok(expired)
    }

    async fn reset_lease(&self, expired: &Message) -> GatewayResult<bool> {
        let mut inner = self.lock()?;
        match inner.messages.get_mut(&expired.id) {
            Some(current) if lease_unchanged(current, expired) => {
                *current = current.reclaimed();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_error(&self, expired: &Message, reason: &str) -> GatewayResult<bool> {
        let mut inner = self.lock()?;
        match inner.messages.get_mut(&expired.id) {
            Some(current) if lease_unchanged(current, expired) => {
                *current = current.poisoned(reason);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_error(&self, id: MessageId) -> GatewayResult<bool> {
        let mut inner = self.lock()?;
        let Some(requeued) = inner
            .messages
            .get(&id)
            .and_then(Message::requeued_from_error)
        else {
            return Ok(false);
        };
        if let Some(key) = &requeued.job {
            if inner.messages.values().any(|m| m.id != id && m.blocks_job_slot(key)) {
                debug!(message_id = %id, job = %key, "Job already has an unconsumed message");
                return Ok(false);
            }
        }
        inner.messages.insert(id, requeued);
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> GatewayResult<u64> {
        let mut inner = self.lock()?;
        let before = inner.messages.len();
        inner.messages.retain(|_, m| {
            !(m.status == MessageStatus::Waiting && m.expires_at.is_some_and(|at| at <= now))
        });
        let purged = (before - inner.messages.len()) as u64;
        if purged > 0 {
            debug!(purged, "Purged expired messages");
        }
        Ok(purged)
    }

    async fn get(&self, id: MessageId) -> GatewayResult<Option<Message>> {
        Ok(self.lock()?.messages.get(&id).cloned())
    }

    async fn count_for_job(&self, name: &str) -> GatewayResult<usize> {
        Ok(self
            .lock()?
            .messages
            .values()
            .filter(|m| m.job.as_ref().is_some_and(|k| k.name == name))
            .count())
    }

    async fn save_job(&self, job: &JobRecord) -> GatewayResult<()> {
        self.lock()?.jobs.insert(job.name.clone(), job.clone());
        Ok(())
    }

    async fn load_jobs(&self) -> GatewayResult<Vec<JobRecord>> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    async fn remove_job(&self, name: &str) -> GatewayResult<bool> {
        let mut inner = self.lock()?;
        match inner.jobs.get_mut(name) {
            Some(job) if job.is_active() => {
                job.removed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_job_fired(&self, name: &str, slot: DateTime<Utc>) -> GatewayResult<()> {
        if let Some(job) = self.lock()?.jobs.get_mut(name) {
            job.mark_fired(slot);
        }
        Ok(())
    }
}
