use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;

/// Header mirroring `Message::retry_count`.
pub const RETRY_COUNT_HEADER: &str = "queueforge-retry-count";
/// Header carrying the reason a message moved to `Error`.
pub const ERROR_HEADER: &str = "queueforge-error";
pub const JOB_NAME_HEADER: &str = "queueforge-job-name";
pub const JOB_SLOT_HEADER: &str = "queueforge-job-slot";

/// Failure reason recorded when the retry limit is hit during lease recovery.
pub const LEASE_EXPIRED_TOO_MANY_TIMES: &str = "LeaseExpiredTooManyTimes";

const LEASE_SEPARATOR: char = '/';

/// Opaque message identifier, assigned at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifies the worker process currently holding a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// A fresh token unique to this process instance.
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::new_v4().simple()))
    }

    /// A token for a single claim made by this owner. Workers sharing one
    /// process token still never hold the same lease.
    pub fn lease(&self) -> Self {
        Self(format!("{}{}{}", self.0, LEASE_SEPARATOR, Uuid::new_v4().simple()))
    }

    /// Whether `lease` was issued by `self.lease()`.
    pub fn issued(&self, lease: &OwnerToken) -> bool {
        lease
            .0
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix(LEASE_SEPARATOR))
            .is_some_and(|suffix| !suffix.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One claim on a message. Renewals and settles succeed only while the
/// stored owner token is still `token`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease {
    pub id: MessageId,
    pub token: OwnerToken,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.token)
    }
}

/// Ordered string -> bytes mapping carried through the whole lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, Vec<u8>)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Option<Vec<u8>> {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Vec<u8>>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Waiting,
    Processing,
    Complete,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Waiting => "waiting",
            MessageStatus::Processing => "processing",
            MessageStatus::Complete => "complete",
            MessageStatus::Error => "error",
        }
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// `Processing -> Waiting` is the lease reset; `Error -> Waiting` is the
    /// one-time requeue (the once-only part is tracked on the message).
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Waiting, Processing)
                | (Processing, Complete)
                | (Processing, Error)
                | (Processing, Waiting)
                | (Error, Waiting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Complete)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(MessageStatus::Waiting),
            "processing" => Ok(MessageStatus::Processing),
            "complete" => Ok(MessageStatus::Complete),
            "error" => Ok(MessageStatus::Error),
            other => Err(GatewayError::Serialization(format!(
                "unknown message status '{}'",
                other
            ))),
        }
    }
}

/// The (job, slot) pair a scheduled message was enqueued for. A job has at
/// most one unconsumed message, and a slot at most one message not in
/// `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobSlotKey {
    pub name: String,
    pub slot: DateTime<Utc>,
}

impl fmt::Display for JobSlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.name,
            self.slot.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// A message as handed to `StorageGateway::insert`.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub route: Option<String>,
    pub priority: Option<i32>,
    pub visible_after: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub job: Option<JobSlotKey>,
}

impl NewMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn visible_after(mut self, at: DateTime<Utc>) -> Self {
        self.visible_after = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Tag the message with the job slot it was produced for.
    pub fn for_job(mut self, name: impl Into<String>, slot: DateTime<Utc>) -> Self {
        let key = JobSlotKey {
            name: name.into(),
            slot,
        };
        self.headers.insert(JOB_NAME_HEADER, key.name.clone());
        self.headers
            .insert(JOB_SLOT_HEADER, slot.to_rfc3339_opts(SecondsFormat::Secs, true));
        self.job = Some(key);
        self
    }

    /// Materialize as a `Waiting` message. `sequence` is the backend's
    /// insertion counter.
    pub fn into_message(self, sequence: u64, now: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            payload: self.payload,
            headers: self.headers,
            status: MessageStatus::Waiting,
            route: self.route,
            priority: self.priority,
            visible_after: self.visible_after,
            expires_at: self.expires_at,
            last_heartbeat: None,
            owner_token: None,
            retry_count: 0,
            requeued: false,
            job: self.job,
            sequence,
            enqueued_at: now,
        }
    }
}

/// Unit of work. The storage gateway owns the durable copy; values held in
/// process are snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub status: MessageStatus,
    pub route: Option<String>,
    pub priority: Option<i32>,
    pub visible_after: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub retry_count: u32,
    /// Set once the single `Error -> Waiting` requeue has been spent.
    pub requeued: bool,
    pub job: Option<JobSlotKey>,
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    /// Eligibility for `Claim` at `now` for a worker subscribed to `routes`.
    pub fn is_claimable(&self, now: DateTime<Utc>, routes: &[String]) -> bool {
        self.status == MessageStatus::Waiting
            && self.visible_after.map_or(true, |at| at <= now)
            && self.expires_at.map_or(true, |at| at > now)
            && self
                .route
                .as_ref()
                .map_or(true, |route| routes.iter().any(|r| r == route))
    }

    /// Sort key for claim order: priority descending, then insertion order.
    pub fn claim_key(&self) -> (Reverse<i32>, u64) {
        (Reverse(self.priority.unwrap_or(0)), self.sequence)
    }

    /// The lease this snapshot was claimed under, while it is `Processing`.
    pub fn lease(&self) -> Option<Lease> {
        if self.status != MessageStatus::Processing {
            return None;
        }
        self.owner_token.clone().map(|token| Lease { id: self.id, token })
    }

    /// Whether this message stops `key` from being enqueued: any unconsumed
    /// message of the same job does, and so does a completed one for the
    /// same slot.
    pub fn blocks_job_slot(&self, key: &JobSlotKey) -> bool {
        match &self.job {
            Some(own) if own.name == key.name => match self.status {
                MessageStatus::Waiting | MessageStatus::Processing => true,
                MessageStatus::Complete => own.slot == key.slot,
                MessageStatus::Error => false,
            },
            _ => false,
        }
    }

    pub fn is_owned_by(&self, owner: &OwnerToken) -> bool {
        self.owner_token.as_ref() == Some(owner)
    }

    /// Whether a `Processing` lease has gone without renewal since `threshold`.
    pub fn lease_expired(&self, threshold: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Processing
            && self.last_heartbeat.map_or(true, |hb| hb < threshold)
    }

    pub fn begin_lease(&mut self, owner: &OwnerToken, now: DateTime<Utc>) {
        self.status = MessageStatus::Processing;
        self.owner_token = Some(owner.clone());
        self.last_heartbeat = Some(now);
    }

    pub fn complete(&mut self) {
        self.status = MessageStatus::Complete;
        self.owner_token = None;
        self.last_heartbeat = None;
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = MessageStatus::Error;
        self.owner_token = None;
        self.last_heartbeat = None;
        self.headers.insert(ERROR_HEADER, reason);
    }

    /// Copy with the lease reset back to `Waiting` and the retry count bumped.
    pub fn reclaimed(&self) -> Message {
        let mut msg = self.clone();
        msg.status = MessageStatus::Waiting;
        msg.owner_token = None;
        msg.last_heartbeat = None;
        msg.bump_retry_count();
        msg
    }

    /// Copy moved to `Error` during lease recovery.
    pub fn poisoned(&self, reason: &str) -> Message {
        let mut msg = self.clone();
        msg.bump_retry_count();
        msg.fail(reason);
        msg
    }

    /// Copy returned to `Waiting` from `Error`, or `None` if the requeue was
    /// already spent or the message was poisoned by lease recovery.
    pub fn requeued_from_error(&self) -> Option<Message> {
        if self.status != MessageStatus::Error
            || self.requeued
            || self.error_reason() == Some(LEASE_EXPIRED_TOO_MANY_TIMES)
        {
            return None;
        }
        let mut msg = self.clone();
        msg.status = MessageStatus::Waiting;
        msg.requeued = true;
        msg.headers.remove(ERROR_HEADER);
        msg.bump_retry_count();
        Some(msg)
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.headers.get_str(ERROR_HEADER)
    }

    fn bump_retry_count(&mut self) {
        self.retry_count += 1;
        self.headers
            .insert(RETRY_COUNT_HEADER, self.retry_count.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn waiting() -> Message {
        NewMessage::new(b"payload".to_vec()).into_message(1, Utc::now())
    }

    #[test]
    fn headers_preserve_insertion_order() {
        let mut headers = Headers::new();
        headers.insert("b", b"1".to_vec());
        headers.insert("a", b"2".to_vec());
        headers.insert("b", b"3".to_vec());
        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(headers.get("b"), Some(&b"3"[..]));
    }

    #[test]
    fn state_machine_transitions() {
        use MessageStatus::*;
        assert!(Waiting.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Complete));
        assert!(Processing.can_transition_to(Error));
        assert!(Error.can_transition_to(Waiting));
        assert!(!Waiting.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Waiting));
        assert!(!Complete.can_transition_to(Processing));
    }

    #[test]
    fn claimable_respects_visibility_expiry_and_route() {
        let now = Utc::now();
        let mut msg = waiting();
        assert!(msg.is_claimable(now, &[]));

        msg.visible_after = Some(now + Duration::seconds(5));
        assert!(!msg.is_claimable(now, &[]));
        msg.visible_after = None;

        msg.expires_at = Some(now - Duration::seconds(1));
        assert!(!msg.is_claimable(now, &[]));
        msg.expires_at = None;

        msg.route = Some("billing".into());
        assert!(!msg.is_claimable(now, &[]));
        assert!(msg.is_claimable(now, &["billing".to_string()]));
    }

    #[test]
    fn reclaim_bumps_retry_count_and_keeps_payload() {
        let owner = OwnerToken::generate();
        let mut msg = waiting();
        msg.begin_lease(&owner, Utc::now());

        let reclaimed = msg.reclaimed();
        assert_eq!(reclaimed.status, MessageStatus::Waiting);
        assert_eq!(reclaimed.owner_token, None);
        assert_eq!(reclaimed.last_heartbeat, None);
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(reclaimed.headers.get_str(RETRY_COUNT_HEADER), Some("1"));
        assert_eq!(reclaimed.payload, msg.payload);
    }

    #[test]
    fn unconsumed_job_message_blocks_every_slot() {
        let slot = Utc::now();
        let next = JobSlotKey {
            name: "job1".into(),
            slot: slot + Duration::minutes(1),
        };
        let mut msg = NewMessage::new(b"x".to_vec())
            .for_job("job1", slot)
            .into_message(1, slot);
        assert!(msg.blocks_job_slot(&next));
        assert!(!msg.blocks_job_slot(&JobSlotKey {
            name: "job2".into(),
            slot,
        }));

        msg.begin_lease(&OwnerToken::new("w").lease(), slot);
        msg.complete();
        assert!(!msg.blocks_job_slot(&next));
        assert!(msg.blocks_job_slot(msg.job.as_ref().unwrap()));

        msg.status = MessageStatus::Error;
        assert!(!msg.blocks_job_slot(msg.job.as_ref().unwrap()));
    }

    #[test]
    fn every_lease_token_is_distinct() {
        let owner = OwnerToken::new("worker-a");
        let first = owner.lease();
        let second = owner.lease();
        assert_ne!(first, second);
        assert!(owner.issued(&first));
        assert!(owner.issued(&second));
        assert!(!OwnerToken::new("worker").issued(&first));
        assert!(!owner.issued(&owner));
    }

    #[test]
    fn lease_only_while_processing() {
        let token = OwnerToken::new("worker-a").lease();
        let mut msg = waiting();
        assert!(msg.lease().is_none());
        msg.begin_lease(&token, Utc::now());
        assert_eq!(msg.lease(), Some(Lease { id: msg.id, token }));
        msg.complete();
        assert!(msg.lease().is_none());
    }

    #[test]
    fn requeue_from_error_is_allowed_once() {
        let mut msg = waiting();
        msg.begin_lease(&OwnerToken::generate(), Utc::now());
        msg.fail("handler blew up");

        let requeued = msg.requeued_from_error().unwrap();
        assert_eq!(requeued.status, MessageStatus::Waiting);
        assert!(requeued.error_reason().is_none());

        let mut again = requeued;
        again.begin_lease(&OwnerToken::generate(), Utc::now());
        again.fail("still broken");
        assert!(again.requeued_from_error().is_none());
    }

    #[test]
    fn poisoned_messages_cannot_be_requeued() {
        let mut msg = waiting();
        msg.begin_lease(&OwnerToken::generate(), Utc::now());
        let poisoned = msg.poisoned(LEASE_EXPIRED_TOO_MANY_TIMES);
        assert_eq!(poisoned.status, MessageStatus::Error);
        assert!(poisoned.requeued_from_error().is_none());
    }
}
