use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sessions::{Message, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    /// System-level instructions for model families that reject `system`.
    Developer,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn from_log(message: &Message) -> Self {
        match message.sender {
            Sender::Client => Self::user(message.content.clone()),
            Sender::Agent => Self::assistant(message.content.clone()),
        }
    }
}

/// Everything the response service sees for one turn.
#[derive(Debug, Clone, Default)]
pub struct ReplyRequest {
    /// Conversation profile.
    pub system_prompt: String,
    /// Prior transcript, oldest first, excluding the turn itself.
    pub history: Vec<ChatMessage>,
    /// The burst being answered, in arrival order.
    pub turn: Vec<String>,
}

impl ReplyRequest {
    /// The burst as one user message.
    pub fn turn_text(&self) -> String {
        self.turn.join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponderError {
    #[error("{0} API key not set; configure responder.api_key or PROSPECT_RELAY_API_KEY")]
    MissingApiKey(String),
    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("{provider} request failed: {message}")]
    Transport { provider: String, message: String },
    #[error("{0} returned an empty reply")]
    Empty(String),
}

/// External response-generation service: text in, text out, may be slow.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, request: &ReplyRequest) -> Result<String, ResponderError>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::{MessageKind, SessionId};

    #[test]
    fn log_rows_map_to_chat_roles() {
        let row = |sender| Message {
            id: 1,
            session_id: SessionId::from_string("s"),
            sender,
            kind: MessageKind::Text,
            content: "hi".into(),
            provider_message_id: None,
            reply_to: None,
            created_at: chrono::Utc::now(),
        };
        assert_eq!(ChatMessage::from_log(&row(Sender::Client)).role, Role::User);
        assert_eq!(
            ChatMessage::from_log(&row(Sender::Agent)).role,
            Role::Assistant
        );
    }

    #[test]
    fn turn_text_keeps_arrival_order() {
        let request = ReplyRequest {
            turn: vec!["hey".into(), "you there?".into()],
            ..ReplyRequest::default()
        };
        assert_eq!(request.turn_text(), "hey\nyou there?");
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&Role::Developer).unwrap();
        assert_eq!(json, "\"developer\"");
    }
}
