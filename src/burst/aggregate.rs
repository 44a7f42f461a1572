//! Collects the client messages that make up the current conversational turn.

use anyhow::Result;
use std::sync::Arc;

use crate::sessions::{Message, MessageLog, Sender, SessionId, Store};

/// All client messages logged after the last answered one, oldest first.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub session_id: SessionId,
    /// Last client message id covered by the previous agent reply.
    pub boundary: Option<i64>,
    pub messages: Vec<Message>,
}

impl PendingTurn {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// The id an agent reply to this turn records as `reply_to`.
    pub fn last_message_id(&self) -> Option<i64> {
        self.messages.last().map(|m| m.id)
    }

    pub fn contents(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.content.clone()).collect()
    }
}

pub struct BurstAggregator {
    store: Arc<dyn Store>,
}

impl BurstAggregator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The last client message already answered, if any.
    ///
    /// An agent row without `reply_to` (e.g. a campaign send) acts as its own boundary.
    pub async fn boundary(&self, session_id: &SessionId) -> Result<Option<i64>> {
        Ok(self
            .store
            .last_agent_message(session_id)
            .await?
            .map(|reply| reply.reply_to.unwrap_or(reply.id)))
    }

    pub async fn pending_turn(&self, session_id: &SessionId) -> Result<PendingTurn> {
        let boundary = self.boundary(session_id).await?;
        let messages = self
            .store
            .messages_after(session_id, boundary)
            .await?
            .into_iter()
            .filter(|m| m.sender == Sender::Client)
            .collect();

        Ok(PendingTurn {
            session_id: session_id.clone(),
            boundary,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{InboundRecord, MessageKind, SessionStore, SqliteStore};

    fn text(provider_id: &str, content: &str) -> InboundRecord {
        InboundRecord {
            provider_message_id: provider_id.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
        }
    }

    async fn setup() -> (Arc<SqliteStore>, SessionId) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let session = store.create_session("5511777770000").await.unwrap();
        (store, session.id)
    }

    #[tokio::test]
    async fn whole_history_is_pending_before_the_first_reply() {
        let (store, sid) = setup().await;
        for (i, body) in ["hey", "you there?", "ok so..."].iter().enumerate() {
            store.append_inbound(&sid, text(&format!("m{i}"), body)).await.unwrap();
        }

        let aggregator = BurstAggregator::new(store.clone());
        let turn = aggregator.pending_turn(&sid).await.unwrap();
        assert_eq!(turn.boundary, None);
        assert_eq!(turn.contents(), vec!["hey", "you there?", "ok so..."]);
    }

    #[tokio::test]
    async fn turn_starts_after_the_answered_message() {
        let (store, sid) = setup().await;
        let first = store.append_inbound(&sid, text("m1", "hey")).await.unwrap();
        // Arrives while the reply to "hey" is being generated.
        store.append_inbound(&sid, text("m2", "one more thing")).await.unwrap();
        store
            .append_agent(&sid, "hello!", Some(first.message.id))
            .await
            .unwrap();
        store.append_inbound(&sid, text("m3", "price?")).await.unwrap();

        let aggregator = BurstAggregator::new(store.clone());
        let turn = aggregator.pending_turn(&sid).await.unwrap();
        assert_eq!(turn.boundary, Some(first.message.id));
        assert_eq!(turn.contents(), vec!["one more thing", "price?"]);
    }

    #[tokio::test]
    async fn agent_row_without_reply_to_is_its_own_boundary() {
        let (store, sid) = setup().await;
        store.append_inbound(&sid, text("m1", "old")).await.unwrap();
        let campaign = store.append_agent(&sid, "New stock arrived!", None).await.unwrap();

        let aggregator = BurstAggregator::new(store.clone());
        assert_eq!(aggregator.boundary(&sid).await.unwrap(), Some(campaign.id));
        assert!(aggregator.pending_turn(&sid).await.unwrap().is_empty());
    }
}
