use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::burst::{LockLease, PendingTurn};
use crate::sessions::{MessageKind, SessionId};

/// The logged client message that triggered one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_id: SessionId,
    /// Message log id of the triggering message.
    pub message_id: i64,
    pub client_id: String,
    pub kind: MessageKind,
    pub received_at: DateTime<Utc>,
}

/// Terminal outcome of one invocation. Nothing propagates to the webhook caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchResult {
    Replied {
        message_id: i64,
        turn_size: usize,
        regenerations: u32,
    },
    /// Generated and persisted, but the messaging gateway did not take it.
    ReplyUndelivered { message_id: i64, error: String },
    Superseded { by: i64 },
    /// The store failed before the lock attempt; nothing was written.
    WaitFailed { reason: String },
    Contended { owner: Option<String> },
    /// The store could not confirm ownership or serve a read; nothing was sent.
    Unavailable { reason: String },
    /// The lease expired before the reply was persisted; the reply was dropped.
    LockLost,
    NothingToAnswer,
    GenerationFailed { error: String },
    TimedOut { after_ms: u64 },
    Skipped { reason: String },
}

impl DispatchResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Replied { .. } => "replied",
            Self::ReplyUndelivered { .. } => "reply_undelivered",
            Self::Superseded { .. } => "superseded",
            Self::WaitFailed { .. } => "wait_failed",
            Self::Contended { .. } => "contended",
            Self::Unavailable { .. } => "unavailable",
            Self::LockLost => "lock_lost",
            Self::NothingToAnswer => "nothing_to_answer",
            Self::GenerationFailed { .. } => "generation_failed",
            Self::TimedOut { .. } => "timed_out",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Replied {
                turn_size,
                regenerations,
                ..
            } => Some(format!("turn_size={turn_size} regenerations={regenerations}")),
            Self::ReplyUndelivered { error, .. } | Self::GenerationFailed { error } => {
                Some(error.clone())
            }
            Self::Superseded { by } => Some(format!("by={by}")),
            Self::Contended { owner } => owner.as_ref().map(|o| format!("owner={o}")),
            Self::Unavailable { reason }
            | Self::WaitFailed { reason }
            | Self::Skipped { reason } => Some(reason.clone()),
            Self::TimedOut { after_ms } => Some(format!("after {after_ms}ms")),
            Self::LockLost | Self::NothingToAnswer => None,
        }
    }

    /// Whether the invocation got as far as a lock attempt and so owes an audit entry.
    pub fn reached_lock_stage(&self) -> bool {
        !matches!(
            self,
            Self::Superseded { .. } | Self::WaitFailed { .. } | Self::Skipped { .. }
        )
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Replied { .. } | Self::ReplyUndelivered { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Lock token of this invocation.
    pub invocation: String,
}

/// Runs one invocation: stability wait, lock election, aggregation, reply.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, message: InboundMessage, context: &DispatchContext) -> DispatchResult;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub invocation: String,
    /// Where the reply is delivered (client chat id).
    pub recipient: String,
}

/// Turns a won lease and its turn into at most one outbound reply.
///
/// Implementations consume the lease and must release it on every path.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    async fn reply(
        &self,
        lease: LockLease,
        turn: PendingTurn,
        context: &ReplyContext,
    ) -> DispatchResult;

    fn name(&self) -> &str;
}
