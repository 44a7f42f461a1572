use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{DispatchResult, ReplyContext, ReplyDispatcher};
use crate::burst::{BurstAggregator, LockError, LockLease, PendingTurn};
use crate::channels::{MessageSender, OutboundMessage};
use crate::providers::{ChatMessage, ReplyRequest, Responder};
use crate::sessions::{MessageLog, Store};

/// Generation and delivery settings of [`GeneratingReplyDispatcher`].
#[derive(Debug, Clone)]
pub struct ReplyPolicy {
    pub system_prompt: String,
    pub history_limit: usize,
    pub response_timeout: Duration,
    pub max_regenerations: u32,
}

/// Asks the responder for a reply, persists it, hands it to the messaging
/// gateway, and releases the lease whatever happened.
pub struct GeneratingReplyDispatcher {
    store: Arc<dyn Store>,
    aggregator: BurstAggregator,
    responder: Arc<dyn Responder>,
    sender: Arc<dyn MessageSender>,
    policy: ReplyPolicy,
}

impl GeneratingReplyDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        responder: Arc<dyn Responder>,
        sender: Arc<dyn MessageSender>,
        policy: ReplyPolicy,
    ) -> Self {
        Self {
            aggregator: BurstAggregator::new(Arc::clone(&store)),
            store,
            responder,
            sender,
            policy,
        }
    }

    async fn build_request(&self, turn: &PendingTurn) -> anyhow::Result<ReplyRequest> {
        let in_turn: HashSet<i64> = turn.messages.iter().map(|m| m.id).collect();
        let transcript = self
            .store
            .transcript(&turn.session_id, self.policy.history_limit + turn.len())
            .await?;
        let mut history: Vec<ChatMessage> = transcript
            .iter()
            .filter(|m| !in_turn.contains(&m.id))
            .map(ChatMessage::from_log)
            .collect();
        if history.len() > self.policy.history_limit {
            history.drain(..history.len() - self.policy.history_limit);
        }

        Ok(ReplyRequest {
            system_prompt: self.policy.system_prompt.clone(),
            history,
            turn: turn.contents(),
        })
    }

    /// One generation, bounded by the response timeout.
    async fn generate(&self, turn: &PendingTurn) -> Result<String, DispatchResult> {
        let request = self
            .build_request(turn)
            .await
            .map_err(|e| DispatchResult::Unavailable {
                reason: format!("failed to load transcript: {e:#}"),
            })?;

        match tokio::time::timeout(self.policy.response_timeout, self.responder.respond(&request))
            .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(error)) => Err(DispatchResult::GenerationFailed {
                error: error.to_string(),
            }),
            Err(_) => Err(DispatchResult::TimedOut {
                after_ms: u64::try_from(self.policy.response_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    async fn answer(
        &self,
        lease: &mut LockLease,
        mut turn: PendingTurn,
        context: &ReplyContext,
    ) -> DispatchResult {
        let mut regenerations = 0;

        let text = loop {
            let text = match self.generate(&turn).await {
                Ok(text) => text,
                Err(result) => return result,
            };
            if regenerations >= self.policy.max_regenerations {
                break text;
            }

            // Messages that landed mid-generation belong to this turn.
            let latest = match self.aggregator.pending_turn(&turn.session_id).await {
                Ok(latest) => latest,
                Err(error) => {
                    tracing::warn!(
                        session_id = %turn.session_id,
                        "Could not re-read turn after generation: {error:#}"
                    );
                    break text;
                }
            };
            if latest.last_message_id() == turn.last_message_id() {
                break text;
            }

            if let Some(result) = renew_or_abort(lease).await {
                return result;
            }
            regenerations += 1;
            tracing::info!(
                session_id = %turn.session_id,
                invocation = %context.invocation,
                previous = turn.len(),
                current = latest.len(),
                "Turn grew during generation; regenerating"
            );
            turn = latest;
        };

        if let Some(result) = renew_or_abort(lease).await {
            return result;
        }

        let reply = match self
            .store
            .append_agent(&turn.session_id, &text, turn.last_message_id())
            .await
        {
            Ok(reply) => reply,
            Err(error) => {
                return DispatchResult::Unavailable {
                    reason: format!("failed to persist reply: {error:#}"),
                }
            }
        };

        let outbound = OutboundMessage {
            recipient: context.recipient.clone(),
            content: text,
        };
        if let Err(error) = self.sender.send(&outbound).await {
            tracing::warn!(
                session_id = %turn.session_id,
                message_id = reply.id,
                "Reply persisted but not delivered: {error}"
            );
            return DispatchResult::ReplyUndelivered {
                message_id: reply.id,
                error: error.to_string(),
            };
        }

        DispatchResult::Replied {
            message_id: reply.id,
            turn_size: turn.len(),
            regenerations,
        }
    }
}

async fn renew_or_abort(lease: &mut LockLease) -> Option<DispatchResult> {
    match lease.renew().await {
        Ok(()) => {
            tracing::debug!(
                session_id = %lease.session_id(),
                expires_at = %lease.expires_at(),
                "Lease renewed"
            );
            None
        }
        Err(LockError::Lost(_)) => Some(DispatchResult::LockLost),
        Err(error) => Some(DispatchResult::Unavailable {
            reason: error.to_string(),
        }),
    }
}

#[async_trait]
impl ReplyDispatcher for GeneratingReplyDispatcher {
    async fn reply(
        &self,
        mut lease: LockLease,
        turn: PendingTurn,
        context: &ReplyContext,
    ) -> DispatchResult {
        let result = self.answer(&mut lease, turn, context).await;

        if let Err(error) = lease.release().await {
            tracing::warn!(
                invocation = %context.invocation,
                "Lock release failed; TTL will reclaim it: {error}"
            );
        }
        result
    }

    fn name(&self) -> &str {
        "generating"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burst::{LockManager, LockOutcome};
    use crate::channels::DeliveryError;
    use crate::providers::ResponderError;
    use crate::sessions::{InboundRecord, MessageKind, SessionId, SessionStore, SqliteStore};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoResponder {
        calls: AtomicUsize,
        seen: Mutex<Vec<ReplyRequest>>,
        delay: Duration,
        /// Appends a client message during the first call.
        interleave: Option<(Arc<SqliteStore>, SessionId)>,
    }

    impl EchoResponder {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                delay,
                interleave: None,
            }
        }
    }

    #[async_trait]
    impl Responder for EchoResponder {
        async fn respond(&self, request: &ReplyRequest) -> Result<String, ResponderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(request.clone());
            if call == 0 {
                if let Some((store, sid)) = &self.interleave {
                    store
                        .append_inbound(
                            sid,
                            InboundRecord {
                                provider_message_id: "late".into(),
                                content: "and delivery?".into(),
                                kind: MessageKind::Text,
                            },
                        )
                        .await
                        .map_err(|e| ResponderError::Empty(e.to_string()))?;
                }
            }
            tokio::time::sleep(self.delay).await;
            Ok(format!("re: {}", request.turn.join(" / ")))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct FailingResponder;

    #[async_trait]
    impl Responder for FailingResponder {
        async fn respond(&self, _request: &ReplyRequest) -> Result<String, ResponderError> {
            Err(ResponderError::Api {
                provider: "fake".into(),
                status: 500,
                message: "upstream exploded".into(),
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutboundMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageSender for RecordingSender {
        async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Transport {
                    channel: "fake".into(),
                    message: "connection reset".into(),
                });
            }
            self.sent.lock().push(message.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn policy() -> ReplyPolicy {
        ReplyPolicy {
            system_prompt: "be brief".into(),
            history_limit: 10,
            response_timeout: Duration::from_millis(500),
            max_regenerations: 1,
        }
    }

    async fn won_lease(store: &Arc<SqliteStore>) -> (SessionId, LockLease) {
        let session = store.create_session("5511444440000").await.unwrap();
        for (i, body) in ["hey", "price of white granite?"].iter().enumerate() {
            store
                .append_inbound(
                    &session.id,
                    InboundRecord {
                        provider_message_id: format!("m{i}"),
                        content: (*body).to_string(),
                        kind: MessageKind::Text,
                    },
                )
                .await
                .unwrap();
        }
        let manager = LockManager::new(store.clone(), Duration::from_secs(30));
        let LockOutcome::Acquired(lease) = manager.acquire(&session.id, "inv-test").await else {
            panic!("lock should be free");
        };
        (session.id, lease)
    }

    fn context() -> ReplyContext {
        ReplyContext {
            invocation: "inv-test".into(),
            recipient: "5511444440000".into(),
        }
    }

    async fn lock_owner(store: &SqliteStore, sid: &SessionId) -> Option<String> {
        store.get_session(sid).await.unwrap().unwrap().lock_owner
    }

    #[tokio::test]
    async fn replies_once_and_releases() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (sid, lease) = won_lease(&store).await;
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = GeneratingReplyDispatcher::new(
            store.clone(),
            Arc::new(EchoResponder::new(Duration::ZERO)),
            sender.clone(),
            policy(),
        );

        let turn = BurstAggregator::new(store.clone()).pending_turn(&sid).await.unwrap();
        let last_client = turn.last_message_id();
        let result = dispatcher.reply(lease, turn, &context()).await;

        let DispatchResult::Replied {
            message_id,
            turn_size,
            regenerations,
        } = result
        else {
            panic!("expected Replied, got {result:?}");
        };
        assert_eq!(turn_size, 2);
        assert_eq!(regenerations, 0);

        let sent = sender.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "re: hey / price of white granite?");

        let reply = store.last_agent_message(&sid).await.unwrap().unwrap();
        assert_eq!(reply.id, message_id);
        assert_eq!(reply.reply_to, last_client);
        assert!(lock_owner(&store, &sid).await.is_none());
    }

    #[tokio::test]
    async fn regenerates_when_the_turn_grows_mid_generation() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (sid, lease) = won_lease(&store).await;
        let mut responder = EchoResponder::new(Duration::ZERO);
        responder.interleave = Some((store.clone(), sid.clone()));
        let responder = Arc::new(responder);
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = GeneratingReplyDispatcher::new(
            store.clone(),
            responder.clone(),
            sender.clone(),
            policy(),
        );

        let turn = BurstAggregator::new(store.clone()).pending_turn(&sid).await.unwrap();
        let result = dispatcher.reply(lease, turn, &context()).await;

        assert!(
            matches!(result, DispatchResult::Replied { turn_size: 3, regenerations: 1, .. }),
            "got {result:?}"
        );
        assert_eq!(responder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sender.sent.lock().len(), 1);
        assert!(sender.sent.lock()[0].content.ends_with("and delivery?"));
        let pending = BurstAggregator::new(store.clone()).pending_turn(&sid).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn generation_failure_sends_nothing_and_releases() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (sid, lease) = won_lease(&store).await;
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = GeneratingReplyDispatcher::new(
            store.clone(),
            Arc::new(FailingResponder),
            sender.clone(),
            policy(),
        );

        let turn = BurstAggregator::new(store.clone()).pending_turn(&sid).await.unwrap();
        let result = dispatcher.reply(lease, turn, &context()).await;

        assert!(matches!(result, DispatchResult::GenerationFailed { .. }));
        assert!(sender.sent.lock().is_empty());
        assert!(store.last_agent_message(&sid).await.unwrap().is_none());
        assert!(lock_owner(&store, &sid).await.is_none());
    }

    #[tokio::test]
    async fn slow_generation_times_out_and_releases() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (sid, lease) = won_lease(&store).await;
        let dispatcher = GeneratingReplyDispatcher::new(
            store.clone(),
            Arc::new(EchoResponder::new(Duration::from_secs(5))),
            Arc::new(RecordingSender::default()),
            ReplyPolicy {
                response_timeout: Duration::from_millis(50),
                ..policy()
            },
        );

        let turn = BurstAggregator::new(store.clone()).pending_turn(&sid).await.unwrap();
        let result = dispatcher.reply(lease, turn, &context()).await;

        assert_eq!(result, DispatchResult::TimedOut { after_ms: 50 });
        assert!(lock_owner(&store, &sid).await.is_none());
    }

    #[tokio::test]
    async fn delivery_failure_keeps_the_persisted_reply() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (sid, lease) = won_lease(&store).await;
        let dispatcher = GeneratingReplyDispatcher::new(
            store.clone(),
            Arc::new(EchoResponder::new(Duration::ZERO)),
            Arc::new(RecordingSender {
                fail: true,
                ..RecordingSender::default()
            }),
            policy(),
        );

        let turn = BurstAggregator::new(store.clone()).pending_turn(&sid).await.unwrap();
        let result = dispatcher.reply(lease, turn, &context()).await;

        let DispatchResult::ReplyUndelivered { message_id, .. } = result else {
            panic!("expected ReplyUndelivered, got {result:?}");
        };
        assert_eq!(
            store.last_agent_message(&sid).await.unwrap().unwrap().id,
            message_id
        );
        assert!(lock_owner(&store, &sid).await.is_none());
    }

    #[tokio::test]
    async fn history_excludes_the_turn_and_respects_the_limit() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let session = store.create_session("5511333330000").await.unwrap();
        for i in 0..6 {
            let client = store
                .append_inbound(
                    &session.id,
                    InboundRecord {
                        provider_message_id: format!("old{i}"),
                        content: format!("question {i}"),
                        kind: MessageKind::Text,
                    },
                )
                .await
                .unwrap();
            store
                .append_agent(&session.id, &format!("answer {i}"), Some(client.message.id))
                .await
                .unwrap();
        }
        store
            .append_inbound(
                &session.id,
                InboundRecord {
                    provider_message_id: "new".into(),
                    content: "new question".into(),
                    kind: MessageKind::Text,
                },
            )
            .await
            .unwrap();

        let dispatcher = GeneratingReplyDispatcher::new(
            store.clone(),
            Arc::new(EchoResponder::new(Duration::ZERO)),
            Arc::new(RecordingSender::default()),
            ReplyPolicy {
                history_limit: 4,
                ..policy()
            },
        );
        let turn = BurstAggregator::new(store.clone())
            .pending_turn(&session.id)
            .await
            .unwrap();
        let request = dispatcher.build_request(&turn).await.unwrap();

        assert_eq!(request.turn, vec!["new question".to_string()]);
        assert_eq!(request.history.len(), 4);
        assert_eq!(request.history.last().unwrap().content, "answer 5");
        assert_eq!(request.history.first().unwrap().content, "question 4");
    }
}
