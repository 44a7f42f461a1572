//! W-API (WhatsApp) webhook parsing and send client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::traits::{
    DeliveryError, InboundEvent, MessageSender, OutboundMessage, PayloadError, WebhookEvent,
};
use crate::config::MessagingConfig;
use crate::sessions::MessageKind;

const RECEIVED_EVENT: &str = "webhookReceived";

const IMAGE_PLACEHOLDER: &str = "[image received]";
const AUDIO_PLACEHOLDER: &str = "[audio received]";
const UNSUPPORTED_PLACEHOLDER: &str = "[unsupported message]";

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Body and kind of a `msgContent` object.
fn extract_content(content: Option<&Value>) -> (String, MessageKind) {
    let Some(content) = content else {
        return (UNSUPPORTED_PLACEHOLDER.into(), MessageKind::Unsupported);
    };

    if let Some(text) = str_at(content, "/conversation") {
        return (text.to_string(), MessageKind::Text);
    }
    if let Some(text) = str_at(content, "/extendedTextMessage/text") {
        return (text.to_string(), MessageKind::Text);
    }
    if content.get("imageMessage").is_some() {
        let caption = str_at(content, "/imageMessage/caption").unwrap_or(IMAGE_PLACEHOLDER);
        return (caption.to_string(), MessageKind::Image);
    }
    if content.get("audioMessage").is_some() {
        return (AUDIO_PLACEHOLDER.into(), MessageKind::Audio);
    }
    (UNSUPPORTED_PLACEHOLDER.into(), MessageKind::Unsupported)
}

/// Stable id for deliveries that carry no `messageId`, so redeliveries still dedupe.
pub fn synthesize_message_id(client_id: &str, moment: Option<i64>, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b"|");
    hasher.update(moment.unwrap_or_default().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(content.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn parse_moment(payload: &Value) -> Option<i64> {
    let raw = payload.get("moment")?;
    raw.as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Parse one W-API webhook body.
pub fn parse_webhook(body: &[u8]) -> Result<WebhookEvent, PayloadError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|e| PayloadError::Json(e.to_string()))?;

    if payload.get("event").and_then(Value::as_str) != Some(RECEIVED_EVENT) {
        return Ok(WebhookEvent::Ignored {
            reason: "not a received-message event",
        });
    }
    if payload.get("fromMe").and_then(Value::as_bool) == Some(true) {
        return Ok(WebhookEvent::Ignored {
            reason: "echo of an outbound message",
        });
    }
    if payload.get("isGroup").and_then(Value::as_bool) == Some(true) {
        return Ok(WebhookEvent::Ignored {
            reason: "group chat",
        });
    }

    let client_id = str_at(&payload, "/chat/id")
        .ok_or(PayloadError::Missing("chat.id"))?
        .to_string();
    let (content, kind) = extract_content(payload.get("msgContent"));
    let moment = parse_moment(&payload);

    let provider_message_id = str_at(&payload, "/messageId").map_or_else(
        || synthesize_message_id(&client_id, moment, &content),
        ToString::to_string,
    );

    Ok(WebhookEvent::Message(InboundEvent {
        client_id,
        provider_message_id,
        content,
        kind,
        instance_id: str_at(&payload, "/instanceId").map(ToString::to_string),
        sender_name: str_at(&payload, "/sender/pushName").map(ToString::to_string),
        sent_at: moment.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
    }))
}

/// Sends text through `POST {base_url}/message/send-text?instanceId=…`.
pub struct WapiSender {
    base_url: String,
    instance_id: Option<String>,
    token: Option<String>,
    client: Client,
}

impl WapiSender {
    pub fn new(config: &MessagingConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            instance_id: config.instance_id.clone().filter(|s| !s.trim().is_empty()),
            token: config.token.clone().filter(|s| !s.trim().is_empty()),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn send_url(&self) -> String {
        format!("{}/message/send-text", self.base_url)
    }
}

#[async_trait]
impl MessageSender for WapiSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let (Some(instance_id), Some(token)) = (&self.instance_id, &self.token) else {
            return Err(DeliveryError::NotConfigured(self.name().to_string()));
        };

        let response = self
            .client
            .post(self.send_url())
            .query(&[("instanceId", instance_id.as_str())])
            .bearer_auth(token)
            .json(&serde_json::json!({
                "phone": message.recipient,
                "message": message.content,
            }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                channel: self.name().to_string(),
                message: crate::providers::sanitize_api_error(&e.to_string()),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                channel: self.name().to_string(),
                status: status.as_u16(),
                message: crate::providers::sanitize_api_error(&body),
            });
        }

        tracing::debug!(
            recipient = %message.recipient,
            status = status.as_u16(),
            "Message handed to W-API"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "wapi"
    }
}
