//! Authoritative state for clients, emails, and follow-ups.
//!
//! The store owns the one correctness property everything else leans on: at
//! most one PENDING follow-up per email, enforced by a partial unique index
//! so that concurrent scan cycles and retried jobs collapse into a single
//! row instead of duplicating work. Status transitions are guarded here too;
//! an illegal transition is a no-op, not an error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::engine::types::{
    Client, Email, EmailStatus, FollowUp, FollowUpDetails, FollowUpStatus, StatusParseError,
};

const CRM_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clients (
    id TEXT PRIMARY KEY,
    company_name TEXT NOT NULL,
    lead_name TEXT NOT NULL,
    email TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'NEW',
    last_contact_date TEXT NOT NULL,
    next_follow_up TEXT,
    pipedrive_org_id INTEGER,
    pipedrive_person_id INTEGER,
    pipedrive_deal_id INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS emails (
    id TEXT PRIMARY KEY,
    client_id TEXT REFERENCES clients(id) ON DELETE SET NULL,
    recipient TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'DRAFT',
    thread_id TEXT,
    sent_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS follow_ups (
    id TEXT PRIMARY KEY,
    email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
    client_id TEXT REFERENCES clients(id) ON DELETE SET NULL,
    content TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING',
    scheduled_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS follow_ups_one_pending
    ON follow_ups(email_id) WHERE status = 'PENDING';
CREATE INDEX IF NOT EXISTS emails_status_sent_at_idx ON emails(status, sent_at);
CREATE INDEX IF NOT EXISTS emails_thread_idx ON emails(thread_id);
CREATE INDEX IF NOT EXISTS follow_ups_status_idx ON follow_ups(status, scheduled_at);
CREATE INDEX IF NOT EXISTS follow_ups_email_idx ON follow_ups(email_id);
CREATE INDEX IF NOT EXISTS clients_next_follow_up_idx ON clients(status, next_follow_up);
"#;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("uuid parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("{0}")]
    StatusParse(#[from] StatusParseError),
    #[error("a pending follow-up already exists for this email")]
    Conflict,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of applying an incoming reply to an email's lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct ReplyApplication {
    /// True when this call transitioned the email SENT -> REPLIED. Duplicate
    /// deliveries of the same reply observe `false` and must not create
    /// chain replies again.
    pub newly_replied: bool,
    pub cancelled: usize,
}

#[derive(Debug)]
pub struct SqliteCrmStore {
    path: PathBuf,
}

impl SqliteCrmStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self { path };
        let conn = store.open()?;
        conn.execute_batch(CRM_SCHEMA)?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    // ----- clients -----

    pub fn insert_client(&self, client: &Client) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO clients (
                id, company_name, lead_name, email, status, last_contact_date,
                next_follow_up, pipedrive_org_id, pipedrive_person_id,
                pipedrive_deal_id, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                client.id.to_string(),
                client.company_name,
                client.lead_name,
                client.email,
                client.status.as_str(),
                format_datetime(client.last_contact_date),
                client.next_follow_up.map(format_datetime),
                client.pipedrive_org_id,
                client.pipedrive_person_id,
                client.pipedrive_deal_id,
                format_datetime(client.created_at),
                format_datetime(client.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_client(&self, id: Uuid) -> Result<Option<Client>, StoreError> {
        let conn = self.open()?;
        let client = conn
            .query_row(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                [id.to_string()],
                |row| client_at(row, 0),
            )
            .optional()?;
        Ok(client)
    }

    pub fn list_clients(&self) -> Result<Vec<Client>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLIENT_COLUMNS} FROM clients ORDER BY last_contact_date DESC"
        ))?;
        let rows = stmt.query_map([], |row| client_at(row, 0))?;
        collect_rows(rows)
    }

    pub fn update_client(&self, client: &Client) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE clients SET
                company_name = ?2, lead_name = ?3, email = ?4, status = ?5,
                last_contact_date = ?6, next_follow_up = ?7, pipedrive_org_id = ?8,
                pipedrive_person_id = ?9, pipedrive_deal_id = ?10, updated_at = ?11
             WHERE id = ?1",
            params![
                client.id.to_string(),
                client.company_name,
                client.lead_name,
                client.email,
                client.status.as_str(),
                format_datetime(client.last_contact_date),
                client.next_follow_up.map(format_datetime),
                client.pipedrive_org_id,
                client.pipedrive_person_id,
                client.pipedrive_deal_id,
                format_datetime(client.updated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_client(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let changed = conn.execute("DELETE FROM clients WHERE id = ?1", [id.to_string()])?;
        Ok(changed > 0)
    }

    /// Refresh contact bookkeeping after an outbound touch or a reply.
    pub fn record_client_contact(
        &self,
        id: Uuid,
        contacted_at: DateTime<Utc>,
        next_follow_up: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE clients SET last_contact_date = ?2, next_follow_up = ?3, updated_at = ?2
             WHERE id = ?1",
            params![
                id.to_string(),
                format_datetime(contacted_at),
                next_follow_up.map(format_datetime),
            ],
        )?;
        Ok(changed > 0)
    }

    /// NEW clients whose next-follow-up moment has elapsed move to CONTACTED.
    pub fn escalate_due_clients(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE clients SET status = 'CONTACTED', updated_at = ?1
             WHERE status = 'NEW' AND next_follow_up IS NOT NULL AND next_follow_up <= ?1",
            [format_datetime(now)],
        )?;
        Ok(changed)
    }

    // ----- emails -----

    pub fn insert_email(&self, email: &Email) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO emails (
                id, client_id, recipient, subject, body, status, thread_id,
                sent_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                email.id.to_string(),
                email.client_id.map(|id| id.to_string()),
                email.recipient,
                email.subject,
                email.body,
                email.status.as_str(),
                email.thread_id,
                email.sent_at.map(format_datetime),
                format_datetime(email.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_email(&self, id: Uuid) -> Result<Option<Email>, StoreError> {
        let conn = self.open()?;
        let email = conn
            .query_row(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                [id.to_string()],
                |row| email_at(row, 0),
            )
            .optional()?;
        Ok(email)
    }

    pub fn list_emails(&self) -> Result<Vec<Email>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             ORDER BY COALESCE(sent_at, created_at) DESC"
        ))?;
        let rows = stmt.query_map([], |row| email_at(row, 0))?;
        collect_rows(rows)
    }

    /// The earliest email of a thread anchors reconciliation.
    pub fn find_email_by_thread(&self, thread_id: &str) -> Result<Option<Email>, StoreError> {
        let conn = self.open()?;
        let email = conn
            .query_row(
                &format!(
                    "SELECT {EMAIL_COLUMNS} FROM emails WHERE thread_id = ?1
                     ORDER BY COALESCE(sent_at, created_at) ASC LIMIT 1"
                ),
                [thread_id],
                |row| email_at(row, 0),
            )
            .optional()?;
        Ok(email)
    }

    /// Guarded monotonic transition; anything else is a no-op returning false.
    pub fn update_email_status(&self, id: Uuid, next: EmailStatus) -> Result<bool, StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM emails WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };
        let current = EmailStatus::from_str(&current)?;
        if !current.can_become(next) {
            return Ok(false);
        }
        tx.execute(
            "UPDATE emails SET status = ?2 WHERE id = ?1",
            params![id.to_string(), next.as_str()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// SQL mirror of `rules::follow_up_due`: SENT, threshold elapsed, and no
    /// follow-up in PENDING or SENT.
    pub fn find_emails_due_for_follow_up(
        &self,
        threshold_days: i64,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Email>, StoreError> {
        let cutoff = format_datetime(now - chrono::Duration::days(threshold_days));
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails e
             WHERE e.status = 'SENT'
               AND e.sent_at IS NOT NULL
               AND e.sent_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM follow_ups f
                   WHERE f.email_id = e.id AND f.status IN ('PENDING', 'SENT')
               )
             ORDER BY e.sent_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![cutoff, limit as i64], |row| email_at(row, 0))?;
        collect_rows(rows)
    }

    /// SENT emails with a known thread, oldest first: the candidates for
    /// reply-detection polling.
    pub fn find_emails_awaiting_reply(&self, limit: usize) -> Result<Vec<Email>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EMAIL_COLUMNS} FROM emails
             WHERE status = 'SENT' AND thread_id IS NOT NULL
             ORDER BY sent_at ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit as i64], |row| email_at(row, 0))?;
        collect_rows(rows)
    }

    pub fn email_has_active_follow_up(&self, email_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM follow_ups
             WHERE email_id = ?1 AND status IN ('PENDING', 'SENT')",
            [email_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn email_counts_by_status(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.counts_by_status("emails")
    }

    pub fn replied_email_count(&self) -> Result<i64, StoreError> {
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE status = 'REPLIED'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ----- follow-ups -----

    /// Create a PENDING follow-up. The partial unique index collapses a
    /// concurrent duplicate into `StoreError::Conflict`, which callers treat
    /// as already-scheduled rather than a failure.
    pub fn create_follow_up(&self, follow_up: &FollowUp) -> Result<(), StoreError> {
        let conn = self.open()?;
        let result = conn.execute(
            "INSERT INTO follow_ups (
                id, email_id, client_id, content, status, scheduled_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                follow_up.id.to_string(),
                follow_up.email_id.to_string(),
                follow_up.client_id.map(|id| id.to_string()),
                follow_up.content,
                follow_up.status.as_str(),
                format_datetime(follow_up.scheduled_at),
                format_datetime(follow_up.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, Some(message)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation
                    && message.contains("UNIQUE") =>
            {
                Err(StoreError::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_follow_up(&self, id: Uuid) -> Result<Option<FollowUp>, StoreError> {
        let conn = self.open()?;
        let follow_up = conn
            .query_row(
                &format!("SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups WHERE id = ?1"),
                [id.to_string()],
                |row| follow_up_at(row, 0),
            )
            .optional()?;
        Ok(follow_up)
    }

    pub fn get_pending_follow_up(&self, email_id: Uuid) -> Result<Option<FollowUp>, StoreError> {
        let conn = self.open()?;
        let follow_up = conn
            .query_row(
                &format!(
                    "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups
                     WHERE email_id = ?1 AND status = 'PENDING'"
                ),
                [email_id.to_string()],
                |row| follow_up_at(row, 0),
            )
            .optional()?;
        Ok(follow_up)
    }

    pub fn list_follow_ups(
        &self,
        status: Option<FollowUpStatus>,
    ) -> Result<Vec<FollowUpDetails>, StoreError> {
        let conn = self.open()?;
        let base = format!(
            "SELECT f.id, f.email_id, f.client_id, f.content, f.status, f.scheduled_at,
                    f.created_at,
                    e.id, e.client_id, e.recipient, e.subject, e.body, e.status,
                    e.thread_id, e.sent_at, e.created_at,
                    c.id, c.company_name, c.lead_name, c.email, c.status,
                    c.last_contact_date, c.next_follow_up, c.pipedrive_org_id,
                    c.pipedrive_person_id, c.pipedrive_deal_id, c.created_at, c.updated_at
             FROM follow_ups f
             JOIN emails e ON e.id = f.email_id
             LEFT JOIN clients c ON c.id = f.client_id
             {filter}
             ORDER BY f.scheduled_at ASC",
            filter = if status.is_some() {
                "WHERE f.status = ?1"
            } else {
                ""
            }
        );
        let mut stmt = conn.prepare(&base)?;
        let map_row = |row: &Row<'_>| -> rusqlite::Result<FollowUpDetails> {
            let follow_up = follow_up_at(row, 0)?;
            let email = email_at(row, 7)?;
            let client = match row.get::<_, Option<String>>(16)? {
                Some(_) => Some(client_at(row, 16)?),
                None => None,
            };
            Ok(FollowUpDetails {
                follow_up,
                email,
                client,
            })
        };
        let rows = match status {
            Some(status) => stmt.query_map([status.as_str()], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        collect_rows(rows)
    }

    /// Replaces the draft; the follow-up must still be PENDING.
    pub fn update_follow_up_content(&self, id: Uuid, content: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE follow_ups SET content = ?2 WHERE id = ?1 AND status = 'PENDING'",
            params![id.to_string(), content],
        )?;
        Ok(changed > 0)
    }

    /// Transitions only out of PENDING; SENT and CANCELLED rows are immutable
    /// (no-op returning false).
    pub fn update_follow_up_status(
        &self,
        id: Uuid,
        next: FollowUpStatus,
    ) -> Result<bool, StoreError> {
        if next == FollowUpStatus::Pending {
            return Ok(false);
        }
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE follow_ups SET status = ?2 WHERE id = ?1 AND status = 'PENDING'",
            params![id.to_string(), next.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn cancel_pending_follow_ups(&self, email_id: Uuid) -> Result<usize, StoreError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE follow_ups SET status = 'CANCELLED'
             WHERE email_id = ?1 AND status = 'PENDING'",
            [email_id.to_string()],
        )?;
        Ok(changed)
    }

    pub fn follow_up_counts_by_status(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.counts_by_status("follow_ups")
    }

    // ----- reconciliation -----

    /// Atomically mark the email replied, cancel its pending follow-ups, and
    /// refresh the linked client's contact date. Serialized against
    /// `create_follow_up` by the immediate transaction plus the partial
    /// unique index.
    pub fn apply_reply(
        &self,
        email_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ReplyApplication>, StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, client_id FROM emails WHERE id = ?1",
                [email_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status_raw, client_id)) = row else {
            return Ok(None);
        };

        let status = EmailStatus::from_str(&status_raw)?;
        let newly_replied = status.can_become(EmailStatus::Replied);
        if newly_replied {
            tx.execute(
                "UPDATE emails SET status = 'REPLIED' WHERE id = ?1",
                [email_id.to_string()],
            )?;
        }
        let cancelled = tx.execute(
            "UPDATE follow_ups SET status = 'CANCELLED'
             WHERE email_id = ?1 AND status = 'PENDING'",
            [email_id.to_string()],
        )?;
        if let Some(client_id) = client_id {
            // A stale future follow-up marker would now sit behind the fresh
            // contact date; clear it until something reschedules.
            tx.execute(
                "UPDATE clients SET last_contact_date = ?2, next_follow_up = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![client_id, format_datetime(now)],
            )?;
        }
        tx.commit()?;
        Ok(Some(ReplyApplication {
            newly_replied,
            cancelled,
        }))
    }

    fn counts_by_status(&self, table: &str) -> Result<BTreeMap<String, i64>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {table} GROUP BY status"
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

const CLIENT_COLUMNS: &str = "id, company_name, lead_name, email, status, last_contact_date, \
     next_follow_up, pipedrive_org_id, pipedrive_person_id, pipedrive_deal_id, created_at, \
     updated_at";
const EMAIL_COLUMNS: &str =
    "id, client_id, recipient, subject, body, status, thread_id, sent_at, created_at";
const FOLLOW_UP_COLUMNS: &str =
    "id, email_id, client_id, content, status, scheduled_at, created_at";

pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|value| value.with_timezone(&Utc))
}

fn conversion_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn uuid_col(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).map_err(|err| conversion_error(index, err))
}

fn optional_uuid_col(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(index)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|err| conversion_error(index, err)),
        None => Ok(None),
    }
}

fn datetime_col(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_datetime(&raw).map_err(|err| conversion_error(index, err))
}

fn optional_datetime_col(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(index)? {
        Some(raw) => parse_datetime(&raw)
            .map(Some)
            .map_err(|err| conversion_error(index, err)),
        None => Ok(None),
    }
}

fn status_col<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = StatusParseError>,
{
    let raw: String = row.get(index)?;
    raw.parse().map_err(|err| conversion_error(index, err))
}

fn client_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Client> {
    Ok(Client {
        id: uuid_col(row, base)?,
        company_name: row.get(base + 1)?,
        lead_name: row.get(base + 2)?,
        email: row.get(base + 3)?,
        status: status_col(row, base + 4)?,
        last_contact_date: datetime_col(row, base + 5)?,
        next_follow_up: optional_datetime_col(row, base + 6)?,
        pipedrive_org_id: row.get(base + 7)?,
        pipedrive_person_id: row.get(base + 8)?,
        pipedrive_deal_id: row.get(base + 9)?,
        created_at: datetime_col(row, base + 10)?,
        updated_at: datetime_col(row, base + 11)?,
    })
}

fn email_at(row: &Row<'_>, base: usize) -> rusqlite::Result<Email> {
    Ok(Email {
        id: uuid_col(row, base)?,
        client_id: optional_uuid_col(row, base + 1)?,
        recipient: row.get(base + 2)?,
        subject: row.get(base + 3)?,
        body: row.get(base + 4)?,
        status: status_col(row, base + 5)?,
        thread_id: row.get(base + 6)?,
        sent_at: optional_datetime_col(row, base + 7)?,
        created_at: datetime_col(row, base + 8)?,
    })
}

fn follow_up_at(row: &Row<'_>, base: usize) -> rusqlite::Result<FollowUp> {
    Ok(FollowUp {
        id: uuid_col(row, base)?,
        email_id: uuid_col(row, base + 1)?,
        client_id: optional_uuid_col(row, base + 2)?,
        content: row.get(base + 3)?,
        status: status_col(row, base + 4)?,
        scheduled_at: datetime_col(row, base + 5)?,
        created_at: datetime_col(row, base + 6)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, StoreError> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use tempfile::TempDir;

    use crate::engine::types::ClientStatus;

    use super::*;

    fn test_store(temp: &TempDir) -> SqliteCrmStore {
        SqliteCrmStore::new(temp.path().join("crm.db")).expect("store")
    }

    fn sample_client(now: DateTime<Utc>) -> Client {
        Client {
            id: Uuid::new_v4(),
            company_name: "Acme".to_string(),
            lead_name: "Jordan Reyes".to_string(),
            email: "jordan@acme.test".to_string(),
            status: ClientStatus::New,
            last_contact_date: now,
            next_follow_up: None,
            pipedrive_org_id: None,
            pipedrive_person_id: None,
            pipedrive_deal_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sent_email(client_id: Option<Uuid>, sent_at: DateTime<Utc>) -> Email {
        Email {
            id: Uuid::new_v4(),
            client_id,
            recipient: "jordan@acme.test".to_string(),
            subject: "Proposal".to_string(),
            body: "Hello".to_string(),
            status: EmailStatus::Sent,
            thread_id: Some("thread-1".to_string()),
            sent_at: Some(sent_at),
            created_at: sent_at,
        }
    }

    fn pending_follow_up(email: &Email, now: DateTime<Utc>) -> FollowUp {
        FollowUp {
            id: Uuid::new_v4(),
            email_id: email.id,
            client_id: email.client_id,
            content: None,
            status: FollowUpStatus::Pending,
            scheduled_at: now,
            created_at: now,
        }
    }

    #[test]
    fn second_pending_follow_up_is_a_conflict() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let email = sent_email(None, now - Duration::days(7));
        store.insert_email(&email).expect("email");

        store
            .create_follow_up(&pending_follow_up(&email, now))
            .expect("first follow-up");
        let err = store
            .create_follow_up(&pending_follow_up(&email, now))
            .expect_err("duplicate pending");
        assert!(matches!(err, StoreError::Conflict));
    }

    #[test]
    fn cancelled_follow_up_frees_the_pending_slot() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let email = sent_email(None, now - Duration::days(7));
        store.insert_email(&email).expect("email");

        let first = pending_follow_up(&email, now);
        store.create_follow_up(&first).expect("first");
        assert_eq!(store.cancel_pending_follow_ups(email.id).expect("cancel"), 1);
        store
            .create_follow_up(&pending_follow_up(&email, now))
            .expect("slot freed after cancel");
    }

    #[test]
    fn terminal_follow_ups_are_immutable() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let email = sent_email(None, now - Duration::days(7));
        store.insert_email(&email).expect("email");
        let follow_up = pending_follow_up(&email, now);
        store.create_follow_up(&follow_up).expect("create");

        assert!(store
            .update_follow_up_status(follow_up.id, FollowUpStatus::Sent)
            .expect("send"));
        assert!(!store
            .update_follow_up_status(follow_up.id, FollowUpStatus::Cancelled)
            .expect("cancel after sent is a no-op"));
        let stored = store
            .get_follow_up(follow_up.id)
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, FollowUpStatus::Sent);
    }

    #[test]
    fn email_status_transitions_are_monotonic() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let email = sent_email(None, now);
        store.insert_email(&email).expect("email");

        assert!(!store
            .update_email_status(email.id, EmailStatus::Sent)
            .expect("sent -> sent rejected"));
        assert!(store
            .update_email_status(email.id, EmailStatus::Replied)
            .expect("sent -> replied"));
        assert!(!store
            .update_email_status(email.id, EmailStatus::Failed)
            .expect("replied is terminal"));
    }

    #[test]
    fn due_scan_honors_threshold_and_active_follow_ups() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();

        let due = sent_email(None, now - Duration::days(6));
        let fresh = sent_email(None, now - Duration::days(6) + Duration::hours(1));
        let covered = sent_email(None, now - Duration::days(9));
        for email in [&due, &fresh, &covered] {
            store.insert_email(email).expect("email");
        }
        store
            .create_follow_up(&pending_follow_up(&covered, now))
            .expect("covering follow-up");

        let found = store
            .find_emails_due_for_follow_up(6, now, 50)
            .expect("scan");
        let ids: Vec<Uuid> = found.iter().map(|email| email.id).collect();
        assert_eq!(ids, vec![due.id]);
    }

    #[test]
    fn sent_follow_up_also_suppresses_due() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let email = sent_email(None, now - Duration::days(9));
        store.insert_email(&email).expect("email");
        let follow_up = pending_follow_up(&email, now);
        store.create_follow_up(&follow_up).expect("create");
        store
            .update_follow_up_status(follow_up.id, FollowUpStatus::Sent)
            .expect("send");

        assert!(store
            .find_emails_due_for_follow_up(6, now, 50)
            .expect("scan")
            .is_empty());
        assert!(store
            .email_has_active_follow_up(email.id)
            .expect("active check"));
    }

    #[test]
    fn apply_reply_is_idempotent_and_touches_client() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let client = sample_client(now - Duration::days(10));
        store.insert_client(&client).expect("client");
        let email = sent_email(Some(client.id), now - Duration::days(7));
        store.insert_email(&email).expect("email");
        store
            .create_follow_up(&pending_follow_up(&email, now))
            .expect("follow-up");

        let first = store
            .apply_reply(email.id, now)
            .expect("apply")
            .expect("email exists");
        assert!(first.newly_replied);
        assert_eq!(first.cancelled, 1);

        let second = store
            .apply_reply(email.id, now)
            .expect("apply again")
            .expect("email exists");
        assert!(!second.newly_replied);
        assert_eq!(second.cancelled, 0);

        let stored = store.get_client(client.id).expect("get").expect("exists");
        assert!(stored.last_contact_date > client.last_contact_date);
    }

    #[test]
    fn escalates_only_new_clients_past_their_follow_up_moment() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();

        let mut due = sample_client(now - Duration::days(10));
        due.next_follow_up = Some(now - Duration::days(1));
        let mut future = sample_client(now - Duration::days(10));
        future.next_follow_up = Some(now + Duration::days(3));
        let mut negotiating = sample_client(now - Duration::days(10));
        negotiating.status = ClientStatus::Negotiating;
        negotiating.next_follow_up = Some(now - Duration::days(1));
        for client in [&due, &future, &negotiating] {
            store.insert_client(client).expect("client");
        }

        assert_eq!(store.escalate_due_clients(now).expect("escalate"), 1);
        let stored = store.get_client(due.id).expect("get").expect("exists");
        assert_eq!(stored.status, ClientStatus::Contacted);
        let untouched = store.get_client(future.id).expect("get").expect("exists");
        assert_eq!(untouched.status, ClientStatus::New);
    }

    #[test]
    fn joined_listing_filters_by_status_and_carries_relations() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let client = sample_client(now);
        store.insert_client(&client).expect("client");
        let email = sent_email(Some(client.id), now - Duration::days(7));
        store.insert_email(&email).expect("email");
        let orphan = sent_email(None, now - Duration::days(8));
        store.insert_email(&orphan).expect("orphan email");

        store
            .create_follow_up(&pending_follow_up(&email, now))
            .expect("linked follow-up");
        let cancelled = pending_follow_up(&orphan, now);
        store.create_follow_up(&cancelled).expect("orphan follow-up");
        store
            .update_follow_up_status(cancelled.id, FollowUpStatus::Cancelled)
            .expect("cancel");

        let pending = store
            .list_follow_ups(Some(FollowUpStatus::Pending))
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].email.id, email.id);
        assert_eq!(
            pending[0].client.as_ref().map(|client| client.id),
            Some(client.id)
        );

        let all = store.list_follow_ups(None).expect("all");
        assert_eq!(all.len(), 2);
        let orphan_row = all
            .iter()
            .find(|details| details.follow_up.email_id == orphan.id)
            .expect("orphan present");
        assert!(orphan_row.client.is_none());
    }

    #[test]
    fn counts_group_by_status() {
        let temp = TempDir::new().expect("tempdir");
        let store = test_store(&temp);
        let now = Utc::now();
        let replied = sent_email(None, now - Duration::days(7));
        store.insert_email(&replied).expect("email");
        store
            .update_email_status(replied.id, EmailStatus::Replied)
            .expect("replied");
        store
            .insert_email(&sent_email(None, now - Duration::days(2)))
            .expect("email");

        let counts = store.email_counts_by_status().expect("counts");
        assert_eq!(counts.get("SENT"), Some(&1));
        assert_eq!(counts.get("REPLIED"), Some(&1));
    }
}
