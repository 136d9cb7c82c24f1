//! SQLite-backed relational gateway.
//!
//! Every lease-changing statement carries its precondition in the `WHERE`
//! clause, so a lost race shows up as zero affected rows.
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use queueforge_core::{
    GatewayError, GatewayResult, Headers, JobRecord, JobSlotKey, Message, MessageId,
    MessageStatus, NewMessage, OwnerToken, StorageGateway,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        status          TEXT NOT NULL,
        route           TEXT,
        priority        INTEGER,
        visible_after   TEXT,
        expires_at      TEXT,
        owner_token     TEXT,
        last_heartbeat  TEXT,
        retry_count     INTEGER NOT NULL DEFAULT 0,
        requeued        INTEGER NOT NULL DEFAULT 0,
        job_name        TEXT,
        job_slot        TEXT,
        enqueued_at     TEXT NOT NULL,
        headers         TEXT NOT NULL,
        payload         BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_claim ON messages(status, priority, seq);
    CREATE INDEX IF NOT EXISTS idx_messages_heartbeat ON messages(status, last_heartbeat);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_job_slot
        ON messages(job_name, job_slot)
        WHERE job_name IS NOT NULL AND status != 'error';
    CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_job_unconsumed
        ON messages(job_name)
        WHERE job_name IS NOT NULL AND status IN ('waiting', 'processing');

    CREATE TABLE IF NOT EXISTS jobs (
        name               TEXT PRIMARY KEY,
        cron_expression    TEXT NOT NULL,
        last_fired_slot    TEXT,
        enqueue_window_ms  INTEGER,
        window_pending     INTEGER NOT NULL DEFAULT 0,
        armed_at           TEXT NOT NULL,
        removed            INTEGER NOT NULL DEFAULT 0
    );
"#;

const MESSAGE_COLUMNS: &str = "seq, id, status, route, priority, visible_after, expires_at, \
     owner_token, last_heartbeat, retry_count, requeued, job_name, job_slot, enqueued_at, \
     headers, payload";

/// Fixed-width RFC 3339 so text comparison matches time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::Serialization(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> GatewayResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn sql_err(err: rusqlite::Error) -> GatewayError {
    GatewayError::Unavailable(format!("sqlite: {}", err))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Raw column values of one `messages` row.
struct MessageRow {
    seq: i64,
    id: String,
    status: String,
    route: Option<String>,
    priority: Option<i32>,
    visible_after: Option<String>,
    expires_at: Option<String>,
    owner_token: Option<String>,
    last_heartbeat: Option<String>,
    retry_count: i64,
    requeued: bool,
    job_name: Option<String>,
    job_slot: Option<String>,
    enqueued_at: String,
    headers: String,
    payload: Vec<u8>,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            status: row.get(2)?,
            route: row.get(3)?,
            priority: row.get(4)?,
            visible_after: row.get(5)?,
            expires_at: row.get(6)?,
            owner_token: row.get(7)?,
            last_heartbeat: row.get(8)?,
            retry_count: row.get(9)?,
            requeued: row.get::<_, i32>(10)? != 0,
            job_name: row.get(11)?,
            job_slot: row.get(12)?,
            enqueued_at: row.get(13)?,
            headers: row.get(14)?,
            payload: row.get(15)?,
        })
    }

    fn into_message(self) -> GatewayResult<Message> {
        let id = self
            .id
            .parse::<MessageId>()
            .map_err(|e| GatewayError::Serialization(format!("bad message id '{}': {}", self.id, e)))?;
        let job = match (self.job_name, self.job_slot) {
            (Some(name), Some(slot)) => Some(JobSlotKey {
                name,
                slot: parse_ts(&slot)?,
            }),
            _ => None,
        };
        let headers: Headers = serde_json::from_str(&self.headers)?;
        Ok(Message {
            id,
            payload: self.payload,
            headers,
            status: self.status.parse()?,
            route: self.route,
            priority: self.priority,
            visible_after: parse_opt_ts(self.visible_after)?,
            expires_at: parse_opt_ts(self.expires_at)?,
            last_heartbeat: parse_opt_ts(self.last_heartbeat)?,
            owner_token: self.owner_token.map(OwnerToken::new),
            retry_count: self.retry_count.max(0) as u32,
            requeued: self.requeued,
            job,
            sequence: self.seq.max(0) as u64,
            enqueued_at: parse_ts(&self.enqueued_at)?,
        })
    }
}

fn load_message(conn: &Connection, id: MessageId) -> GatewayResult<Option<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    conn.query_row(&sql, params![id.to_string()], MessageRow::from_row)
        .optional()
        .map_err(sql_err)?
        .map(MessageRow::into_message)
        .transpose()
}

/// Write back the mutable columns of `msg`, guarded by `guard_sql`. A write
/// that would break a job uniqueness index is `DuplicateKey`.
fn write_state(conn: &Connection, msg: &Message, guard_sql: &str, guard: &[&dyn rusqlite::ToSql]) -> GatewayResult<bool> {
    let headers = serde_json::to_string(&msg.headers)?;
    let sql = format!(
        "UPDATE messages SET status = ?1, owner_token = ?2, last_heartbeat = ?3, \
         retry_count = ?4, requeued = ?5, headers = ?6 WHERE id = ?7 AND {}",
        guard_sql
    );
    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(7 + guard.len());
    let status = msg.status.as_str();
    let owner = msg.owner_token.as_ref().map(|o| o.as_str().to_string());
    let heartbeat = msg.last_heartbeat.map(ts);
    let retry_count = msg.retry_count as i64;
    let requeued = msg.requeued as i32;
    let id = msg.id.to_string();
    values.push(&status);
    values.push(&owner);
    values.push(&heartbeat);
    values.push(&retry_count);
    values.push(&requeued);
    values.push(&headers);
    values.push(&id);
    values.extend_from_slice(guard);
    match conn.execute(&sql, values.as_slice()) {
        Ok(changed) => Ok(changed == 1),
        Err(e) if is_constraint_violation(&e) => Err(GatewayError::DuplicateKey(
            msg.job
                .as_ref()
                .map(|k| k.to_string())
                .unwrap_or_else(|| msg.id.to_string()),
        )),
        Err(e) => Err(sql_err(e)),
    }
}

pub struct SqliteGateway {
    conn: Mutex<Connection>,
}

impl SqliteGateway {
    /// Open or create the store at the given path.
    pub fn open(path: &str) -> GatewayResult<Self> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(sql_err)?;
        let store = Self::init(conn)?;
        info!(path = %path, "SQLite gateway opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> GatewayResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> GatewayResult<Self> {
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> GatewayResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| GatewayError::Unavailable("sqlite connection lock poisoned".into()))
    }

    /// Classify a zero-row lease update as `NotFound` or `NotOwned`.
    fn lease_conflict(conn: &Connection, id: MessageId) -> GatewayError {
        match load_message(conn, id) {
            Ok(Some(msg)) if msg.status == MessageStatus::Processing => GatewayError::NotOwned(id),
            Ok(_) => GatewayError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl StorageGateway for SqliteGateway {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert(&self, message: NewMessage) -> GatewayResult<MessageId> {
        let conn = self.conn()?;
        let msg = message.into_message(0, Utc::now());
        let headers = serde_json::to_string(&msg.headers)?;
        let result = conn.execute(
            "INSERT INTO messages (id, status, route, priority, visible_after, expires_at,
                 retry_count, requeued, job_name, job_slot, enqueued_at, headers, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7, ?8, ?9, ?10, ?11)",
            params![
                msg.id.to_string(),
                msg.status.as_str(),
                msg.route,
                msg.priority,
                msg.visible_after.map(ts),
                msg.expires_at.map(ts),
                msg.job.as_ref().map(|k| k.name.clone()),
                msg.job.as_ref().map(|k| ts(k.slot)),
                ts(msg.enqueued_at),
                headers,
                msg.payload,
            ],
        );
        match result {
            Ok(_) => Ok(msg.id),
            Err(e) if is_constraint_violation(&e) => Err(GatewayError::DuplicateKey(
                msg.job
                    .as_ref()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| msg.id.to_string()),
            )),
            Err(e) => Err(sql_err(e)),
        }
    }

    async fn try_claim_next(
        &self,
        routes: &[String],
        owner: &OwnerToken,
        now: DateTime<Utc>,
    ) -> GatewayResult<Option<Message>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let routes_json = serde_json::to_string(routes)?;
        let now_ts = ts(now);

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM messages
                 WHERE status = 'waiting'
                   AND (visible_after IS NULL OR visible_after <= ?1)
                   AND (expires_at IS NULL OR expires_at > ?1)
                   AND (route IS NULL OR route IN (SELECT value FROM json_each(?2)))
                 ORDER BY COALESCE(priority, 0) DESC, seq ASC
                 LIMIT 1",
                params![now_ts, routes_json],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claimed = tx
            .execute(
                "UPDATE messages SET status = 'processing', owner_token = ?1, last_heartbeat = ?2
                 WHERE id = ?3 AND status = 'waiting'",
                params![owner.as_str(), now_ts, id],
            )
            .map_err(sql_err)?;
        if claimed != 1 {
            return Ok(None);
        }

        let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
        let row = tx
            .query_row(&sql, params![id], MessageRow::from_row)
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        row.into_message().map(Some)
    }

    async fn heartbeat(&self, id: MessageId, owner: &OwnerToken, now: DateTime<Utc>) -> GatewayResult<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE messages SET last_heartbeat = ?1
                 WHERE id = ?2 AND status = 'processing' AND owner_token = ?3",
                params![ts(now), id.to_string(), owner.as_str()],
            )
            .map_err(sql_err)?;
        if changed == 1 {
            Ok(())
        } else {
            Err(Self::lease_conflict(&conn, id))
        }
    }

    async fn complete(&self, id: MessageId, owner: &OwnerToken) -> GatewayResult<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE messages SET status = 'complete', owner_token = NULL, last_heartbeat = NULL
                 WHERE id = ?1 AND status = 'processing' AND owner_token = ?2",
                params![id.to_string(), owner.as_str()],
            )
            .map_err(sql_err)?;
        if changed == 1 {
            return Ok(());
        }
        match load_message(&conn, id)? {
            Some(msg) if msg.status == MessageStatus::Complete => Ok(()),
            Some(_) => Err(GatewayError::NotOwned(id)),
            None => Err(GatewayError::NotFound(id)),
        }
    }

    async fn fail(&self, id: MessageId, owner: &OwnerToken, reason: &str) -> GatewayResult<()> {
        let conn = self.conn()?;
        let Some(mut msg) = load_message(&conn, id)? else {
            return Err(GatewayError::NotFound(id));
        };
        if msg.status != MessageStatus::Processing || !msg.is_owned_by(owner) {
            return Err(GatewayError::NotOwned(id));
        }
        msg.fail(reason);
        let owner_str = owner.as_str();
        if write_state(&conn, &msg, "status = 'processing' AND owner_token = ?8", &[&owner_str])? {
            Ok(())
        } else {
            Err(GatewayError::NotOwned(id))
        }
    }

    async fn scan_expired_leases(&self, threshold: DateTime<Utc>) -> GatewayResult<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages
             WHERE status = 'processing' AND (last_heartbeat IS NULL OR last_heartbeat < ?1)
             ORDER BY seq ASC",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![ts(threshold)], MessageRow::from_row)
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn reset_lease(&self, expired: &Message) -> GatewayResult<bool> {
        let conn = self.conn()?;
        let owner = expired.owner_token.as_ref().map(|o| o.as_str().to_string());
        let heartbeat = expired.last_heartbeat.map(ts);
        write_state(
            &conn,
            &expired.reclaimed(),
            "status = 'processing' AND owner_token IS ?8 AND last_heartbeat IS ?9",
            &[&owner, &heartbeat],
        )
    }

    async fn mark_error(&self, expired: &Message, reason: &str) -> GatewayResult<bool> {
        let conn = self.conn()?;
        let owner = expired.owner_token.as_ref().map(|o| o.as_str().to_string());
        let heartbeat = expired.last_heartbeat.map(ts);
        write_state(
            &conn,
            &expired.poisoned(reason),
            "status = 'processing' AND owner_token IS ?8 AND last_heartbeat IS ?9",
            &[&owner, &heartbeat],
        )
    }

    async fn requeue_error(&self, id: MessageId) -> GatewayResult<bool> {
        let conn = self.conn()?;
        let Some(msg) = load_message(&conn, id)? else {
            return Ok(false);
        };
        let Some(requeued) = msg.requeued_from_error() else {
            return Ok(false);
        };
        match write_state(&conn, &requeued, "status = 'error' AND requeued = 0", &[]) {
            Err(GatewayError::DuplicateKey(key)) => {
                debug!(message_id = %id, job = %key, "Job already has an unconsumed message");
                Ok(false)
            }
            other => other,
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> GatewayResult<u64> {
        let conn = self.conn()?;
        let purged = conn
            .execute(
                "DELETE FROM messages
                 WHERE status = 'waiting' AND expires_at IS NOT NULL AND expires_at <= ?1",
                params![ts(now)],
            )
            .map_err(sql_err)?;
        if purged > 0 {
            debug!(purged, "Purged expired messages");
        }
        Ok(purged as u64)
    }

    async fn get(&self, id: MessageId) -> GatewayResult<Option<Message>> {
        let conn = self.conn()?;
        load_message(&conn, id)
    }

    async fn count_for_job(&self, name: &str) -> GatewayResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE job_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count.max(0) as usize)
    }

    async fn save_job(&self, job: &JobRecord) -> GatewayResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (name, cron_expression, last_fired_slot, enqueue_window_ms,
                 window_pending, armed_at, removed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name) DO UPDATE SET
                 cron_expression = excluded.cron_expression,
                 last_fired_slot = excluded.last_fired_slot,
                 enqueue_window_ms = excluded.enqueue_window_ms,
                 window_pending = excluded.window_pending,
                 armed_at = excluded.armed_at,
                 removed = excluded.removed",
            params![
                job.name,
                job.cron_expression,
                job.last_fired_slot.map(ts),
                job.enqueue_window.map(|w| w.as_millis() as i64),
                job.window_pending as i32,
                ts(job.armed_at),
                job.removed as i32,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn load_jobs(&self) -> GatewayResult<Vec<JobRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT name, cron_expression, last_fired_slot, enqueue_window_ms,
                        window_pending, armed_at, removed
                 FROM jobs ORDER BY name",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, i32>(4)? != 0,
                    row.get::<_, String>(5)?,
                    row.get::<_, i32>(6)? != 0,
                ))
            })
            .map_err(sql_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(sql_err)?;

        rows.into_iter()
            .map(
                |(name, cron_expression, last_fired, window_ms, window_pending, armed_at, removed)| {
                    Ok(JobRecord {
                        name,
                        cron_expression,
                        last_fired_slot: parse_opt_ts(last_fired)?,
                        enqueue_window: window_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
                        window_pending,
                        armed_at: parse_ts(&armed_at)?,
                        removed,
                    })
                },
            )
            .collect()
    }

    async fn remove_job(&self, name: &str) -> GatewayResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET removed = 1 WHERE name = ?1 AND removed = 0",
                params![name],
            )
            .map_err(sql_err)?;
        Ok(changed == 1)
    }

    async fn record_job_fired(&self, name: &str, slot: DateTime<Utc>) -> GatewayResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET last_fired_slot = ?1, window_pending = 0 WHERE name = ?2",
            params![ts(slot), name],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}
