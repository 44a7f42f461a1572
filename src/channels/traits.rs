use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sessions::MessageKind;

/// One client message extracted from a messaging-gateway webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Client chat id (phone number for WhatsApp).
    pub client_id: String,
    /// Gateway message id; the idempotency key of the message log.
    pub provider_message_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub instance_id: Option<String>,
    pub sender_name: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Parsed webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    Message(InboundEvent),
    /// Acknowledged and dropped (status events, echoes of our own sends, groups).
    Ignored { reason: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("webhook payload is not valid JSON: {0}")]
    Json(String),
    #[error("webhook payload is missing {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub recipient: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("{0} sender is not configured (missing instance id or token)")]
    NotConfigured(String),
    #[error("{channel} rejected the message ({status}): {message}")]
    Rejected {
        channel: String,
        status: u16,
        message: String,
    },
    #[error("{channel} request failed: {message}")]
    Transport { channel: String, message: String },
}

/// Outbound half of the messaging gateway. Fire-and-log: callers record
/// failures but never retry inline.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;

    fn name(&self) -> &str;
}
