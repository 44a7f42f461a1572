//! Response-generation backends.
//!
//! Each backend implements [`Responder`]; [`create_responder`] builds the
//! configured one.

pub mod compatible;
pub mod traits;

pub use compatible::OpenAiCompatibleResponder;
pub use traits::{ChatMessage, ReplyRequest, Responder, ResponderError, Role};

use crate::config::ResponderConfig;
use std::sync::Arc;

const MAX_API_ERROR_CHARS: usize = 200;

fn is_secret_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn token_end(input: &str, from: usize) -> usize {
    let mut end = from;
    for (i, c) in input[from..].char_indices() {
        if is_secret_char(c) {
            end = from + i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

/// Scrub known secret-like tokens from upstream error strings.
///
/// Redacts `sk-` API keys and anything following a `Bearer ` marker.
pub fn scrub_secret_patterns(input: &str) -> String {
    const PREFIXES: [&str; 3] = ["sk-", "Bearer ", "bearer "];

    let mut scrubbed = input.to_string();

    for prefix in PREFIXES {
        let mut search_from = 0;
        loop {
            let Some(rel) = scrubbed[search_from..].find(prefix) else {
                break;
            };

            let start = search_from + rel;
            let content_start = start + prefix.len();
            let end = token_end(&scrubbed, content_start);

            if end == content_start {
                search_from = content_start;
                continue;
            }

            scrubbed.replace_range(start..end, "[REDACTED]");
            search_from = start + "[REDACTED]".len();
        }
    }

    scrubbed
}

/// Sanitize API error text by scrubbing secrets and truncating length.
pub fn sanitize_api_error(input: &str) -> String {
    let scrubbed = scrub_secret_patterns(input);

    if scrubbed.chars().count() <= MAX_API_ERROR_CHARS {
        return scrubbed;
    }

    let mut end = MAX_API_ERROR_CHARS;
    while end > 0 && !scrubbed.is_char_boundary(end) {
        end -= 1;
    }

    format!("{}...", &scrubbed[..end])
}

/// Build a sanitized responder error from a failed HTTP response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> ResponderError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
    ResponderError::Api {
        provider: provider.to_string(),
        status: status.as_u16(),
        message: sanitize_api_error(&body),
    }
}

/// Factory: the configured response service.
pub fn create_responder(config: &ResponderConfig) -> Arc<dyn Responder> {
    if config.api_key.is_none() {
        tracing::warn!(
            model = %config.model,
            "No responder API key configured; replies will fail until one is set"
        );
    }
    Arc::new(OpenAiCompatibleResponder::new("openai", config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_builds_named_responder() {
        let responder = create_responder(&ResponderConfig::default());
        assert_eq!(responder.name(), "openai");
    }

    // ── API error sanitization ───────────────────────────────

    #[test]
    fn sanitize_scrubs_sk_prefix() {
        let input = "request failed: sk-1234567890abcdef";
        let out = sanitize_api_error(input);
        assert!(!out.contains("sk-1234567890abcdef"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn sanitize_scrubs_bearer_tokens() {
        let input = "rejected header Authorization: Bearer abc.def-123 for instance";
        let out = sanitize_api_error(input);
        assert_eq!(out, "rejected header Authorization: [REDACTED] for instance");
    }

    #[test]
    fn sanitize_truncates_long_error() {
        let long = "a".repeat(400);
        let result = sanitize_api_error(&long);
        assert!(result.len() <= 203);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn sanitize_no_secret_no_change() {
        let input = "simple upstream timeout";
        assert_eq!(sanitize_api_error(input), input);
    }

    #[test]
    fn bare_prefix_is_left_alone() {
        assert_eq!(scrub_secret_patterns("task- sk- done"), "task- sk- done");
    }
}
