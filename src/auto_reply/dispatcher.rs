use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use super::traits::{
    DispatchContext, DispatchResult, Dispatcher, InboundMessage, ReplyContext, ReplyDispatcher,
};
use crate::burst::{
    self, BurstAggregator, BurstTimings, Decision, LockManager, LockOutcome, StabilityDetector,
};
use crate::sessions::{AuditEntry, AuditLog, SessionId, SessionStore, Store};

/// Wait for the burst to settle, elect one writer, and hand the turn to the
/// reply dispatcher.
///
/// Every invocation that reaches the lock stage leaves exactly one audit
/// entry; superseded and skipped invocations leave none.
pub struct BurstDispatcher {
    store: Arc<dyn Store>,
    detector: StabilityDetector,
    locks: LockManager,
    aggregator: BurstAggregator,
    replies: Arc<dyn ReplyDispatcher>,
}

impl BurstDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        timings: BurstTimings,
        replies: Arc<dyn ReplyDispatcher>,
    ) -> Self {
        Self {
            detector: burst::create_stability_detector(Arc::clone(&store), timings),
            locks: burst::create_lock_manager(Arc::clone(&store), timings),
            aggregator: BurstAggregator::new(Arc::clone(&store)),
            store,
            replies,
        }
    }

    async fn run(&self, message: &InboundMessage, context: &DispatchContext) -> DispatchResult {
        let session_id = &message.session_id;

        if !message.kind.triggers_reply() {
            return DispatchResult::Skipped {
                reason: format!("{} message", message.kind.as_str()),
            };
        }

        match self.store.get_session(session_id).await {
            Ok(Some(session)) if !session.ai_enabled => {
                return DispatchResult::Skipped {
                    reason: "ai disabled".into(),
                }
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                return DispatchResult::Skipped {
                    reason: "session not found".into(),
                }
            }
            Err(error) => {
                return DispatchResult::WaitFailed {
                    reason: format!("{error:#}"),
                }
            }
        }

        let decision = match self
            .detector
            .wait_for_quiet(session_id, message.message_id)
            .await
        {
            Ok(decision) => decision,
            Err(error) => {
                return DispatchResult::WaitFailed {
                    reason: format!("{error:#}"),
                }
            }
        };
        if let Decision::Superseded { by } = decision {
            return DispatchResult::Superseded { by };
        }
        tracing::debug!(
            session_id = %session_id,
            invocation = %context.invocation,
            decision = decision.as_str(),
            "Burst settled"
        );

        let lease = match self.locks.acquire(session_id, &context.invocation).await {
            LockOutcome::Acquired(lease) => lease,
            LockOutcome::Contended { owner } => return DispatchResult::Contended { owner },
            LockOutcome::Unavailable(error) => {
                return DispatchResult::Unavailable {
                    reason: error.to_string(),
                }
            }
        };

        let turn = match self.aggregator.pending_turn(session_id).await {
            Ok(turn) => turn,
            Err(error) => {
                release_quietly(lease).await;
                return DispatchResult::Unavailable {
                    reason: format!("{error:#}"),
                };
            }
        };
        if turn.is_empty() {
            // A previous winner already answered everything.
            release_quietly(lease).await;
            return DispatchResult::NothingToAnswer;
        }

        let reply_context = ReplyContext {
            invocation: context.invocation.clone(),
            recipient: message.client_id.clone(),
        };
        self.replies.reply(lease, turn, &reply_context).await
    }

    async fn audit(&self, session_id: &SessionId, invocation: &str, result: &DispatchResult) {
        let entry = AuditEntry {
            session_id: session_id.clone(),
            invocation: invocation.to_string(),
            outcome: result.outcome().to_string(),
            detail: result.detail(),
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.record_outcome(entry).await {
            tracing::warn!(
                session_id = %session_id,
                invocation,
                "Failed to write audit entry: {error:#}"
            );
        }
    }
}

async fn release_quietly(lease: crate::burst::LockLease) {
    if let Err(error) = lease.release().await {
        tracing::warn!("Lock release failed; TTL will reclaim it: {error}");
    }
}

#[async_trait]
impl Dispatcher for BurstDispatcher {
    async fn dispatch(&self, message: InboundMessage, context: &DispatchContext) -> DispatchResult {
        let result = self.run(&message, context).await;

        if result.reached_lock_stage() {
            self.audit(&message.session_id, &context.invocation, &result)
                .await;
        }
        tracing::info!(
            session_id = %message.session_id,
            message_id = message.message_id,
            invocation = %context.invocation,
            outcome = result.outcome(),
            "Invocation finished"
        );
        result
    }

    fn name(&self) -> &str {
        "burst"
    }
}
