//! OpenAI-compatible chat completions responder.
//! Works against any endpoint speaking the `/v1/chat/completions` format.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::traits::{ChatMessage, ReplyRequest, Responder, ResponderError, Role};
use crate::config::ResponderConfig;

const MAX_REPLY_TOKENS: u32 = 1000;

pub struct OpenAiCompatibleResponder {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    single_paragraph: bool,
    client: Client,
}

impl OpenAiCompatibleResponder {
    pub fn new(name: &str, config: &ResponderConfig) -> Self {
        Self {
            name: name.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(ToString::to_string),
            model: config.model.clone(),
            temperature: config.temperature,
            single_paragraph: config.single_paragraph,
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Build the full URL for chat completions, detecting if base_url already includes the path.
    fn chat_completions_url(&self) -> String {
        let has_full_endpoint = reqwest::Url::parse(&self.base_url)
            .map(|url| {
                url.path()
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            })
            .unwrap_or_else(|_| self.base_url.ends_with("/chat/completions"));

        if has_full_endpoint {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn build_request<'a>(&'a self, request: &'a ReplyRequest) -> ChatRequest<'a> {
        let family = ModelFamily::of(&self.model);
        let system_role = if family.uses_developer_role() {
            Role::Developer
        } else {
            Role::System
        };

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if !request.system_prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: system_role,
                content: request.system_prompt.clone(),
            });
        }
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::user(request.turn_text()));

        let new_token_param = family.uses_developer_role();
        ChatRequest {
            model: &self.model,
            messages,
            temperature: family.accepts_temperature().then_some(self.temperature),
            max_tokens: (!new_token_param).then_some(MAX_REPLY_TOKENS),
            max_completion_tokens: new_token_param.then_some(MAX_REPLY_TOKENS),
            reasoning_effort: family.reasoning_effort(&self.model),
        }
    }
}

/// Request-shape differences between OpenAI model generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    Legacy,
    Gpt41,
    Gpt5,
    OSeries,
}

impl ModelFamily {
    fn of(model: &str) -> Self {
        let model = model.rsplit('/').next().unwrap_or(model);
        if model.starts_with("gpt-5") {
            Self::Gpt5
        } else if model.starts_with("gpt-4.1") {
            Self::Gpt41
        } else if ["o1", "o3", "o4"].iter().any(|p| model.starts_with(p)) {
            Self::OSeries
        } else {
            Self::Legacy
        }
    }

    fn uses_developer_role(self) -> bool {
        !matches!(self, Self::Legacy)
    }

    fn accepts_temperature(self) -> bool {
        matches!(self, Self::Legacy | Self::Gpt41)
    }

    fn reasoning_effort(self, model: &str) -> Option<&'static str> {
        let model = model.rsplit('/').next().unwrap_or(model);
        match self {
            Self::Gpt5 if model.starts_with("gpt-5.1") => Some("none"),
            Self::Gpt5 if model == "gpt-5-pro" => Some("medium"),
            Self::Gpt5 | Self::OSeries => Some("low"),
            Self::Legacy | Self::Gpt41 => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat apps render one bubble per message; keep the reply on one line.
pub fn collapse_to_paragraph(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Responder for OpenAiCompatibleResponder {
    async fn respond(&self, request: &ReplyRequest) -> Result<String, ResponderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ResponderError::MissingApiKey(self.name.clone()))?;

        let body = self.build_request(request);
        let url = self.chat_completions_url();

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ResponderError::Transport {
                provider: self.name.clone(),
                message: super::sanitize_api_error(&e.to_string()),
            })?;

        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }

        let chat_response: ApiChatResponse =
            response.json().await.map_err(|e| ResponderError::Transport {
                provider: self.name.clone(),
                message: format!("invalid response body: {e}"),
            })?;

        let text = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ResponderError::Empty(self.name.clone()))?;

        Ok(if self.single_paragraph {
            collapse_to_paragraph(&text)
        } else {
            text
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};

    fn make_responder(base_url: &str, key: Option<&str>, model: &str) -> OpenAiCompatibleResponder {
        let config = ResponderConfig {
            base_url: base_url.to_string(),
            api_key: key.map(ToString::to_string),
            model: model.to_string(),
            ..ResponderConfig::default()
        };
        OpenAiCompatibleResponder::new("openai", &config)
    }

    fn sample_request() -> ReplyRequest {
        ReplyRequest {
            system_prompt: "be brief".into(),
            history: vec![ChatMessage::assistant("Hi! Interested in granite?")],
            turn: vec!["hey".into(), "price?".into()],
        }
    }

    #[test]
    fn strips_trailing_slash_and_appends_endpoint() {
        let p = make_responder("https://api.openai.com/v1/", None, "gpt-4o-mini");
        assert_eq!(
            p.chat_completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn full_endpoint_is_used_verbatim() {
        let p = make_responder(
            "https://gateway.example.com/api/v3/chat/completions",
            None,
            "gpt-4o-mini",
        );
        assert_eq!(
            p.chat_completions_url(),
            "https://gateway.example.com/api/v3/chat/completions"
        );
    }

    #[test]
    fn legacy_models_get_system_role_and_temperature() {
        let p = make_responder("https://api.openai.com/v1", Some("k"), "gpt-4o-mini");
        let request = sample_request();
        let json = serde_json::to_value(p.build_request(&request)).unwrap();

        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert_eq!(json["messages"][2]["content"], "hey\nprice?");
        assert!(json["temperature"].is_number());
        assert_eq!(json["max_tokens"], 1000);
        assert!(json.get("max_completion_tokens").is_none());
        assert!(json.get("reasoning_effort").is_none());
    }

    #[test]
    fn gpt5_models_get_developer_role_and_reasoning_effort() {
        let p = make_responder("https://api.openai.com/v1", Some("k"), "gpt-5-mini");
        let request = sample_request();
        let json = serde_json::to_value(p.build_request(&request)).unwrap();

        assert_eq!(json["messages"][0]["role"], "developer");
        assert!(json.get("temperature").is_none());
        assert_eq!(json["max_completion_tokens"], 1000);
        assert_eq!(json["reasoning_effort"], "low");

        let p = make_responder("https://api.openai.com/v1", Some("k"), "gpt-5.1");
        let json = serde_json::to_value(p.build_request(&request)).unwrap();
        assert_eq!(json["reasoning_effort"], "none");
    }

    #[test]
    fn gpt41_keeps_temperature_without_reasoning() {
        assert_eq!(ModelFamily::of("gpt-4.1-mini"), ModelFamily::Gpt41);
        assert!(ModelFamily::Gpt41.accepts_temperature());
        assert_eq!(ModelFamily::Gpt41.reasoning_effort("gpt-4.1-mini"), None);
        assert_eq!(ModelFamily::of("openai/o4-mini"), ModelFamily::OSeries);
    }

    #[test]
    fn blank_system_prompt_is_omitted() {
        let p = make_responder("https://api.openai.com/v1", Some("k"), "gpt-4o-mini");
        let request = ReplyRequest {
            turn: vec!["hey".into()],
            ..ReplyRequest::default()
        };
        let json = serde_json::to_value(p.build_request(&request)).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn collapse_joins_lines_and_spaces() {
        assert_eq!(
            collapse_to_paragraph("  Sure!\n\nWe have   white granite.\nWant a quote? "),
            "Sure! We have white granite. Want a quote?"
        );
    }

    #[tokio::test]
    async fn respond_fails_without_key() {
        let p = make_responder("https://api.openai.com/v1", None, "gpt-4o-mini");
        let err = p.respond(&sample_request()).await.unwrap_err();
        assert!(matches!(err, ResponderError::MissingApiKey(_)));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn respond_round_trips_through_a_local_endpoint() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|Json(body): Json<serde_json::Value>| async move {
                let last = body["messages"]
                    .as_array()
                    .and_then(|m| m.last())
                    .and_then(|m| m["content"].as_str())
                    .unwrap_or_default()
                    .to_string();
                Json(serde_json::json!({
                    "choices": [{ "message": { "content": format!("got:\n{last}") } }]
                }))
            }),
        );
        let base = serve(router).await;

        let p = make_responder(&base, Some("sk-test"), "gpt-4o-mini");
        let reply = p.respond(&sample_request()).await.unwrap();
        assert_eq!(reply, "got: hey price?");
    }

    #[tokio::test]
    async fn respond_surfaces_sanitized_api_errors() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    "invalid key sk-leaked123456",
                )
            }),
        );
        let base = serve(router).await;

        let p = make_responder(&base, Some("sk-test"), "gpt-4o-mini");
        match p.respond(&sample_request()).await.unwrap_err() {
            ResponderError::Api {
                status, message, ..
            } => {
                assert_eq!(status, 401);
                assert!(!message.contains("sk-leaked123456"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
