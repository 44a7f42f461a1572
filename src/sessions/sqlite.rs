//! SQLite-backed session store, message log, and audit log.
//!
//! Every handle owns its own connection. Several handles (or processes) may
//! open the same database file; coordination between them happens only
//! through conditional statements against the shared rows.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{
    Appended, AuditEntry, AuditLog, InboundRecord, LockAttempt, Message, MessageKind, MessageLog,
    Sender, Session, SessionId, SessionStatus, SessionStore,
};

const STORE_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "session_id, client_id, status, ai_enabled, last_message_id, \
     last_inbound_message_id, lock_owner, lock_expires_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, session_id, sender, kind, content, provider_message_id, reply_to, created_at";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open store DB: {}", db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set store busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("Failed to configure store pragmas")?;

        Self::init_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), "Session store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database; handles do not share state.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to configure store pragmas")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                status TEXT NOT NULL,
                ai_enabled INTEGER NOT NULL DEFAULT 1,
                last_message_id INTEGER,
                last_inbound_message_id INTEGER,
                lock_owner TEXT,
                lock_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                provider_message_id TEXT,
                reply_to INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                invocation TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT,
                created_at INTEGER NOT NULL
             );

             CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_provider_id
                ON messages(session_id, provider_message_id);
             CREATE INDEX IF NOT EXISTS idx_messages_session_order
                ON messages(session_id, created_at, id);
             CREATE INDEX IF NOT EXISTS idx_sessions_client
                ON sessions(client_id, created_at DESC);
             CREATE INDEX IF NOT EXISTS idx_audit_session
                ON audit_log(session_id, id DESC);",
        )
        .context("Failed to initialize store schema")?;

        conn.pragma_update(None, "user_version", STORE_SCHEMA_VERSION)
            .context("Failed to set store schema version")?;
        Ok(())
    }

    /// Run a blocking database operation off the async workers.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut guard)
        })
        .await
        .context("Store task panicked")?
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(2)?;
    Ok(Session {
        id: SessionId::from_string(row.get::<_, String>(0)?),
        client_id: row.get(1)?,
        status: SessionStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "status".into(), rusqlite::types::Type::Text)
        })?,
        ai_enabled: row.get(3)?,
        last_message_id: row.get(4)?,
        last_inbound_message_id: row.get(5)?,
        lock_owner: row.get(6)?,
        lock_expires_at: row.get::<_, Option<i64>>(7)?.map(from_ms),
        created_at: from_ms(row.get(8)?),
        updated_at: from_ms(row.get(9)?),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sender: String = row.get(2)?;
    let kind: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        session_id: SessionId::from_string(row.get::<_, String>(1)?),
        sender: Sender::parse(&sender).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(2, "sender".into(), rusqlite::types::Type::Text)
        })?,
        kind: MessageKind::parse(&kind).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(3, "kind".into(), rusqlite::types::Type::Text)
        })?,
        content: row.get(4)?,
        provider_message_id: row.get(5)?,
        reply_to: row.get(6)?,
        created_at: from_ms(row.get(7)?),
    })
}

fn session_exists(conn: &Connection, session_id: &str) -> Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE session_id = ?1)",
        params![session_id],
        |row| row.get(0),
    )
    .context("Failed to check session existence")
}

/// `created_at` never moves backwards within a session, even if the wall clock does.
fn next_created_at(conn: &Connection, session_id: &str) -> Result<i64> {
    let latest: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(created_at), 0) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .context("Failed to read latest message timestamp")?;
    Ok(now_ms().max(latest))
}

fn load_message(conn: &Connection, message_id: i64) -> Result<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![message_id],
        message_from_row,
    )
    .context("Failed to read back message")
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, client_id: &str) -> Result<Session> {
        let client_id = client_id.trim().to_string();
        if client_id.is_empty() {
            bail!("client id must not be empty");
        }
        self.with_conn(move |conn| {
            let id = SessionId::new();
            let now = now_ms();
            conn.execute(
                "INSERT INTO sessions (session_id, client_id, status, ai_enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4)",
                params![id.as_str(), client_id, SessionStatus::Started.as_str(), now],
            )
            .context("Failed to insert session")?;
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![id.as_str()],
                session_from_row,
            )
            .context("Failed to read back session")
        })
        .await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"),
                params![id.as_str()],
                session_from_row,
            )
            .optional()
            .context("Failed to query session")
        })
        .await
    }

    async fn find_active_session(&self, client_id: &str) -> Result<Option<Session>> {
        let client_id = client_id.trim().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE client_id = ?1 AND status IN ('started', 'active')
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![client_id],
                session_from_row,
            )
            .optional()
            .context("Failed to query active session")
        })
        .await
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC LIMIT ?1"
                ))
                .context("Failed to prepare list_sessions query")?;
            let rows = stmt
                .query_map(params![sql_limit(limit)], session_from_row)
                .context("Failed to query sessions")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to decode sessions")
        })
        .await
    }

    async fn set_ai_enabled(&self, id: &SessionId, enabled: bool) -> Result<bool> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET ai_enabled = ?1, updated_at = ?2 WHERE session_id = ?3",
                    params![enabled, now_ms(), id.as_str()],
                )
                .context("Failed to update ai_enabled")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn try_acquire_lock(
        &self,
        id: &SessionId,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        let id = id.clone();
        let token = token.to_string();
        self.with_conn(move |conn| {
            let now = now_ms();
            let expires_at = now.saturating_add(duration_ms(ttl));
            // The affected-row count is the compare-and-set result.
            let changed = conn
                .execute(
                    "UPDATE sessions
                     SET lock_owner = ?1, lock_expires_at = ?2, updated_at = ?3
                     WHERE session_id = ?4
                       AND (lock_owner IS NULL OR lock_expires_at IS NULL OR lock_expires_at <= ?3)",
                    params![token, expires_at, now, id.as_str()],
                )
                .context("Failed to execute lock acquisition")?;

            if changed == 1 {
                return Ok(LockAttempt::Acquired {
                    expires_at: from_ms(expires_at),
                });
            }

            let current = conn
                .query_row(
                    "SELECT lock_owner, lock_expires_at FROM sessions WHERE session_id = ?1",
                    params![id.as_str()],
                    |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<i64>>(1)?)),
                )
                .optional()
                .context("Failed to read lock owner")?;

            Ok(match current {
                None => LockAttempt::MissingSession,
                Some((owner, expires_at)) => LockAttempt::Held {
                    owner,
                    expires_at: expires_at.map(from_ms),
                },
            })
        })
        .await
    }

    async fn release_lock(&self, id: &SessionId, token: &str) -> Result<bool> {
        let id = id.clone();
        let token = token.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions
                     SET lock_owner = NULL, lock_expires_at = NULL, updated_at = ?1
                     WHERE session_id = ?2 AND lock_owner = ?3",
                    params![now_ms(), id.as_str(), token],
                )
                .context("Failed to execute lock release")?;
            Ok(changed == 1)
        })
        .await
    }

    async fn renew_lock(&self, id: &SessionId, token: &str, ttl: Duration) -> Result<bool> {
        let id = id.clone();
        let token = token.to_string();
        self.with_conn(move |conn| {
            let now = now_ms();
            let changed = conn
                .execute(
                    "UPDATE sessions
                     SET lock_expires_at = ?1, updated_at = ?2
                     WHERE session_id = ?3 AND lock_owner = ?4 AND lock_expires_at > ?2",
                    params![now.saturating_add(duration_ms(ttl)), now, id.as_str(), token],
                )
                .context("Failed to execute lock renewal")?;
            Ok(changed == 1)
        })
        .await
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl MessageLog for SqliteStore {
    async fn append_inbound(&self, id: &SessionId, record: InboundRecord) -> Result<Appended> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("Failed to start inbound append transaction")?;

            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE session_id = ?1 AND provider_message_id = ?2"
                    ),
                    params![id.as_str(), record.provider_message_id],
                    message_from_row,
                )
                .optional()
                .context("Failed to look up provider message id")?;

            if let Some(message) = existing {
                tx.commit()
                    .context("Failed to commit read-only append transaction")?;
                return Ok(Appended {
                    message,
                    duplicate: true,
                });
            }

            if !session_exists(&tx, id.as_str())? {
                bail!("session not found: {id}");
            }

            let created_at = next_created_at(&tx, id.as_str())?;
            tx.execute(
                "INSERT INTO messages (session_id, sender, kind, content, provider_message_id, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
                params![
                    id.as_str(),
                    Sender::Client.as_str(),
                    record.kind.as_str(),
                    record.content,
                    record.provider_message_id,
                    created_at
                ],
            )
            .context("Failed to insert inbound message")?;
            let message_id = tx.last_insert_rowid();

            // Only reply-triggering messages move the supersession pointer.
            let moves_inbound_pointer = record.kind.triggers_reply();
            tx.execute(
                "UPDATE sessions
                 SET last_message_id = MAX(COALESCE(last_message_id, 0), ?1),
                     last_inbound_message_id = CASE WHEN ?2
                         THEN MAX(COALESCE(last_inbound_message_id, 0), ?1)
                         ELSE last_inbound_message_id END,
                     updated_at = ?3
                 WHERE session_id = ?4",
                params![message_id, moves_inbound_pointer, created_at, id.as_str()],
            )
            .context("Failed to advance session message pointers")?;

            let message = load_message(&tx, message_id)?;
            tx.commit()
                .context("Failed to commit inbound append transaction")?;
            Ok(Appended {
                message,
                duplicate: false,
            })
        })
        .await
    }

    async fn append_agent(
        &self,
        id: &SessionId,
        content: &str,
        reply_to: Option<i64>,
    ) -> Result<Message> {
        let id = id.clone();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("Failed to start agent append transaction")?;

            if !session_exists(&tx, id.as_str())? {
                bail!("session not found: {id}");
            }

            let created_at = next_created_at(&tx, id.as_str())?;
            tx.execute(
                "INSERT INTO messages (session_id, sender, kind, content, provider_message_id, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)",
                params![
                    id.as_str(),
                    Sender::Agent.as_str(),
                    MessageKind::Text.as_str(),
                    content,
                    reply_to,
                    created_at
                ],
            )
            .context("Failed to insert agent message")?;
            let message_id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE sessions
                 SET last_message_id = MAX(COALESCE(last_message_id, 0), ?1),
                     status = ?2,
                     updated_at = ?3
                 WHERE session_id = ?4",
                params![
                    message_id,
                    SessionStatus::Active.as_str(),
                    created_at,
                    id.as_str()
                ],
            )
            .context("Failed to advance session message pointer")?;

            let message = load_message(&tx, message_id)?;
            tx.commit()
                .context("Failed to commit agent append transaction")?;
            Ok(message)
        })
        .await
    }

    async fn latest_inbound(&self, id: &SessionId) -> Result<Option<Message>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE session_id = ?1 AND sender = 'client' AND kind = 'text'
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![id.as_str()],
                message_from_row,
            )
            .optional()
            .context("Failed to query latest inbound message")
        })
        .await
    }

    async fn last_agent_message(&self, id: &SessionId) -> Result<Option<Message>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE session_id = ?1 AND sender = 'agent'
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![id.as_str()],
                message_from_row,
            )
            .optional()
            .context("Failed to query last agent message")
        })
        .await
    }

    async fn messages_after(&self, id: &SessionId, after: Option<i64>) -> Result<Vec<Message>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE session_id = ?1 AND id > ?2
                     ORDER BY created_at ASC, id ASC"
                ))
                .context("Failed to prepare messages_after query")?;
            let rows = stmt
                .query_map(params![id.as_str(), after.unwrap_or(0)], message_from_row)
                .context("Failed to query messages")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to decode messages")
        })
        .await
    }

    async fn transcript(&self, id: &SessionId, limit: usize) -> Result<Vec<Message>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE session_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2"
                ))
                .context("Failed to prepare transcript query")?;
            let rows = stmt
                .query_map(params![id.as_str(), sql_limit(limit)], message_from_row)
                .context("Failed to query transcript")?;
            let mut messages = rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to decode transcript")?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }
}

#[async_trait]
impl AuditLog for SqliteStore {
    async fn record_outcome(&self, entry: AuditEntry) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (session_id, invocation, outcome, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.session_id.as_str(),
                    entry.invocation,
                    entry.outcome,
                    entry.detail,
                    entry.created_at.timestamp_millis()
                ],
            )
            .context("Failed to write audit entry")?;
            Ok(())
        })
        .await
    }

    async fn audit_trail(&self, id: &SessionId, limit: usize) -> Result<Vec<AuditEntry>> {
        let id = id.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, invocation, outcome, detail, created_at
                     FROM audit_log
                     WHERE session_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )
                .context("Failed to prepare audit_trail query")?;
            let rows = stmt
                .query_map(params![id.as_str(), sql_limit(limit)], |row| {
                    Ok(AuditEntry {
                        session_id: SessionId::from_string(row.get::<_, String>(0)?),
                        invocation: row.get(1)?,
                        outcome: row.get(2)?,
                        detail: row.get(3)?,
                        created_at: from_ms(row.get(4)?),
                    })
                })
                .context("Failed to query audit trail")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to decode audit trail")
        })
        .await
    }
}
