//! Messaging gateway: inbound webhook parsing and outbound delivery.

pub mod traits;
pub mod wapi;

pub use traits::{
    DeliveryError, InboundEvent, MessageSender, OutboundMessage, PayloadError, WebhookEvent,
};
pub use wapi::{parse_webhook, WapiSender};

use crate::config::MessagingConfig;
use std::sync::Arc;

pub fn create_sender(config: &MessagingConfig) -> Arc<dyn MessageSender> {
    if !config.is_configured() {
        tracing::warn!("W-API credentials missing; outbound replies will be logged as undelivered");
    }
    Arc::new(WapiSender::new(config))
}
