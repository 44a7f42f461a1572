//! Session storage traits and types for conversation state, the message log,
//! and the per-session processing lock.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identifier of one client conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(Self::Started),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Client,
    Agent,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client" => Some(Self::Client),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// Payload kind of a message. Only text starts a reply cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Unsupported,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Unsupported => "unsupported",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "unsupported" => Some(Self::Unsupported),
            _ => None,
        }
    }

    pub fn triggers_reply(self) -> bool {
        matches!(self, Self::Text)
    }
}

/// One conversation row, including the lock token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub client_id: String,
    pub status: SessionStatus,
    pub ai_enabled: bool,
    /// Most recently persisted message of any sender.
    pub last_message_id: Option<i64>,
    /// Most recently persisted client message; the supersession pointer.
    pub last_inbound_message_id: Option<i64>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A lock only counts as held while `now < lock_expires_at`.
    pub fn lock_held_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }
}

/// An immutable row of the message log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub session_id: SessionId,
    pub sender: Sender,
    pub kind: MessageKind,
    pub content: String,
    pub provider_message_id: Option<String>,
    /// For agent replies: the last client message the reply answered.
    pub reply_to: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A client message as delivered by the messaging gateway.
#[derive(Debug, Clone)]
pub struct InboundRecord {
    pub provider_message_id: String,
    pub content: String,
    pub kind: MessageKind,
}

/// Result of an idempotent inbound append.
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    /// True when the provider message id was already logged; nothing was written.
    pub duplicate: bool,
}

/// Result of one compare-and-set lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired {
        expires_at: DateTime<Utc>,
    },
    /// Another token holds an unexpired lock. The owner is read after the
    /// failed update and is for diagnostics only.
    Held {
        owner: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    MissingSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: SessionId,
    pub invocation: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session rows and the lock token pair stored on them.
///
/// Lock operations must each execute as one conditional statement against
/// the datastore; implementations may not split them into read-then-write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Start a new conversation for a client.
    async fn create_session(&self, client_id: &str) -> Result<Session>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Latest session for the client whose status is `started` or `active`.
    async fn find_active_session(&self, client_id: &str) -> Result<Option<Session>>;

    async fn list_sessions(&self, limit: usize) -> Result<Vec<Session>>;

    /// Returns false when the session does not exist.
    async fn set_ai_enabled(&self, id: &SessionId, enabled: bool) -> Result<bool>;

    /// Set `lock_owner = token` iff the lock is free or expired.
    async fn try_acquire_lock(
        &self,
        id: &SessionId,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt>;

    /// Clear the lock iff `token` still owns it. Returns whether anything changed.
    async fn release_lock(&self, id: &SessionId, token: &str) -> Result<bool>;

    /// Push the expiry forward iff `token` still owns an unexpired lock.
    async fn renew_lock(&self, id: &SessionId, token: &str, ttl: Duration) -> Result<bool>;

    /// The name of this store implementation.
    fn name(&self) -> &str;
}

/// Append-only message log, ordered by `(created_at, id)`.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Idempotent by `(session, provider_message_id)`.
    async fn append_inbound(&self, id: &SessionId, record: InboundRecord) -> Result<Appended>;

    async fn append_agent(
        &self,
        id: &SessionId,
        content: &str,
        reply_to: Option<i64>,
    ) -> Result<Message>;

    async fn latest_inbound(&self, id: &SessionId) -> Result<Option<Message>>;

    async fn last_agent_message(&self, id: &SessionId) -> Result<Option<Message>>;

    /// Every message with `id > after` (all messages when `after` is `None`).
    async fn messages_after(&self, id: &SessionId, after: Option<i64>) -> Result<Vec<Message>>;

    /// The most recent `limit` messages, oldest first.
    async fn transcript(&self, id: &SessionId, limit: usize) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_outcome(&self, entry: AuditEntry) -> Result<()>;

    /// Most recent entries, newest first.
    async fn audit_trail(&self, id: &SessionId, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Everything an invocation needs from the shared persistent store.
pub trait Store: SessionStore + MessageLog + AuditLog {}

impl<T: SessionStore + MessageLog + AuditLog> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with_lock(owner: Option<&str>, expires_at: Option<DateTime<Utc>>) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::from_string("s-1"),
            client_id: "5511999990000".to_string(),
            status: SessionStatus::Active,
            ai_enabled: true,
            last_message_id: None,
            last_inbound_message_id: None,
            lock_owner: owner.map(ToString::to_string),
            lock_expires_at: expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn lock_is_held_only_before_expiry() {
        let now = Utc::now();
        let held = session_with_lock(Some("t1"), Some(now + chrono::Duration::seconds(5)));
        assert!(held.lock_held_at(now));

        let expired = session_with_lock(Some("t1"), Some(now - chrono::Duration::seconds(1)));
        assert!(!expired.lock_held_at(now));

        let at_boundary = session_with_lock(Some("t1"), Some(now));
        assert!(!at_boundary.lock_held_at(now));

        assert!(!session_with_lock(None, None).lock_held_at(now));
    }

    #[test]
    fn enum_names_round_trip_through_storage_strings() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::Audio,
            MessageKind::Unsupported,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(Sender::parse("agent"), Some(Sender::Agent));
        assert_eq!(SessionStatus::parse("started"), Some(SessionStatus::Started));
        assert_eq!(Sender::parse("bot"), None);
    }

    #[test]
    fn only_text_triggers_a_reply() {
        assert!(MessageKind::Text.triggers_reply());
        assert!(!MessageKind::Image.triggers_reply());
        assert!(!MessageKind::Audio.triggers_reply());
        assert!(!MessageKind::Unsupported.triggers_reply());
    }
}
