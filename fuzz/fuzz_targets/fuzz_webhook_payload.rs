#![no_main]
use libfuzzer_sys::fuzz_target;
use prospect_relay::channels::{parse_webhook, WebhookEvent};

fuzz_target!(|data: &[u8]| {
    if let Ok(WebhookEvent::Message(event)) = parse_webhook(data) {
        // A parsed message always carries a chat id and an idempotency key.
        assert!(!event.client_id.is_empty());
        assert!(!event.provider_message_id.is_empty());
    }
});
