//! Durable work queue decoupling "work is due" from "work is executed".
//!
//! Delivery is at-least-once: a claimed job whose worker dies is reclaimed
//! after its lease expires, and a job whose handler fails is retried with
//! backoff until the attempt budget runs out, after which it is kept as a
//! dead letter for manual inspection. Enqueueing is deduplicated by key, so
//! overlapping scan cycles pushing the same email collapse to one row.

use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crm_store::{format_datetime, parse_datetime};

const DEFAULT_LEASE_SECS: i64 = 60;
const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Linear backoff step between retries, matching attempts * 5s.
const BACKOFF_STEP_SECS: i64 = 5;

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_queue (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    dedupe_key TEXT NOT NULL UNIQUE,
    payload_json TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    locked_at TEXT,
    processed_at TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    available_at TEXT
);
CREATE INDEX IF NOT EXISTS task_queue_pending_idx
    ON task_queue(status, available_at, created_at);
"#;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("uuid error: {0}")]
    Uuid(#[from] uuid::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
}

/// Typed job payload. New job kinds extend this enum; the queue stores the
/// serde-tagged JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    FollowUp { email_id: Uuid },
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::FollowUp { .. } => "follow_up",
        }
    }

    /// Stable identity for dedupe: one follow-up job per email.
    pub fn dedupe_key(&self) -> String {
        let raw = match self {
            JobKind::FollowUp { email_id } => format!("follow_up:{email_id}"),
        };
        format!("{:x}", md5::compute(raw))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueResult {
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: JobKind,
    pub attempts: i64,
}

/// A job that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub job: JobKind,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, job: &JobKind) -> Result<EnqueueResult, QueueError>;
    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError>;
    fn mark_done(&self, id: Uuid) -> Result<(), QueueError>;
    fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError>;
    fn pending_len(&self) -> Result<i64, QueueError>;
    fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;
}

#[derive(Debug)]
pub struct SqliteTaskQueue {
    path: PathBuf,
    lease_secs: i64,
    max_attempts: i64,
}

impl SqliteTaskQueue {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        Self::with_policy(path, DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_policy(
        path: impl Into<PathBuf>,
        lease_secs: i64,
        max_attempts: i64,
    ) -> Result<Self, QueueError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let queue = Self {
            path,
            lease_secs,
            max_attempts,
        };
        let conn = queue.open()?;
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(queue)
    }

    fn open(&self) -> Result<Connection, QueueError> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        Ok(conn)
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn enqueue(&self, job: &JobKind) -> Result<EnqueueResult, QueueError> {
        let conn = self.open()?;
        let payload_json = serde_json::to_string(job)?;
        let inserted = conn.execute(
            "INSERT INTO task_queue
                (id, kind, dedupe_key, payload_json, status, created_at, attempts)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0)
             ON CONFLICT (dedupe_key) DO NOTHING",
            params![
                Uuid::new_v4().to_string(),
                job.label(),
                job.dedupe_key(),
                payload_json,
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(EnqueueResult {
            inserted: inserted > 0,
        })
    }

    fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut conn = self.open()?;
        let now = Utc::now();
        let stale_cutoff = format_datetime(now - Duration::seconds(self.lease_secs));
        let now_raw = format_datetime(now);

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT id, payload_json, attempts
                 FROM task_queue
                 WHERE (
                     status = 'pending'
                     OR (status = 'processing' AND locked_at < ?1)
                 )
                   AND (available_at IS NULL OR available_at <= ?2)
                   AND attempts < ?3
                 ORDER BY created_at
                 LIMIT 1",
                params![stale_cutoff, now_raw, self.max_attempts],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id_raw, payload_json, attempts)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE task_queue
             SET status = 'processing', locked_at = ?2, attempts = attempts + 1
             WHERE id = ?1",
            params![id_raw, now_raw],
        )?;
        tx.commit()?;

        let job: JobKind = serde_json::from_str(&payload_json)?;
        Ok(Some(ClaimedJob {
            id: Uuid::parse_str(&id_raw)?,
            job,
            attempts: attempts + 1,
        }))
    }

    fn mark_done(&self, id: Uuid) -> Result<(), QueueError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE task_queue
             SET status = 'done', processed_at = ?2, locked_at = NULL
             WHERE id = ?1",
            params![id.to_string(), format_datetime(Utc::now())],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let conn = self.open()?;
        let attempts: i64 = conn.query_row(
            "SELECT attempts FROM task_queue WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )?;
        let now = Utc::now();

        if attempts >= self.max_attempts {
            conn.execute(
                "UPDATE task_queue
                 SET status = 'dead', processed_at = ?2, locked_at = NULL,
                     available_at = NULL, last_error = ?3
                 WHERE id = ?1",
                params![id.to_string(), format_datetime(now), error],
            )?;
        } else {
            let backoff = Duration::seconds(attempts.max(1) * BACKOFF_STEP_SECS);
            conn.execute(
                "UPDATE task_queue
                 SET status = 'pending', processed_at = ?2, locked_at = NULL,
                     available_at = ?3, last_error = ?4
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    format_datetime(now),
                    format_datetime(now + backoff),
                    error,
                ],
            )?;
        }
        Ok(())
    }

    fn pending_len(&self) -> Result<i64, QueueError> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM task_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload_json, attempts, last_error, processed_at
             FROM task_queue WHERE status = 'dead' ORDER BY processed_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (id_raw, payload_json, attempts, last_error, failed_at_raw) = row?;
            let failed_at = match failed_at_raw {
                Some(raw) => Some(parse_datetime(&raw)?),
                None => None,
            };
            letters.push(DeadLetter {
                id: Uuid::parse_str(&id_raw)?,
                job: serde_json::from_str(&payload_json)?,
                attempts,
                last_error,
                failed_at,
            });
        }
        Ok(letters)
    }
}
