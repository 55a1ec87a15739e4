//! Chat-completion transport. Components only see `ChatClient`; the HTTP
//! implementation talks to any OpenAI-style chat endpoint (the configured
//! default is Mistral's).

use crate::config::LlmConfig;
use crate::models::{TradingError, TradingResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// One completion round-trip. The deadline is hard; expiry surfaces as
    /// a typed timeout error at the call site.
    async fn complete(&self, system: &str, user: &str, timeout: Duration) -> TradingResult<String>;
}

pub struct HttpChatClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpChatClient {
    pub fn new(config: &LlmConfig) -> TradingResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("sage-bot/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TradingError::LlmError(format!("http client build: {}", e)))?;
        let api_key = if config.api_key_env.is_empty() {
            None
        } else {
            std::env::var(&config.api_key_env).ok()
        };
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(&self, system: &str, user: &str, timeout: Duration) -> TradingResult<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": 0.3,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| TradingError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
                context: "chat completion".to_string(),
            })?
            .map_err(|e| TradingError::LlmError(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(TradingError::LlmError(format!(
                "chat endpoint returned {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TradingError::LlmError(format!("response decode: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TradingError::LlmError("empty choices".to_string()))?;

        debug!("🧠 Chat completion received ({} chars)", content.len());
        Ok(content)
    }
}

/// Strip surrounding markdown fences and any prose around the first JSON
/// value. Models wrap JSON in ```json fences often enough that both the
/// strategist and reflection parsers go through this.
pub fn extract_json(raw: &str) -> String {
    let mut text = raw.trim();
    if text.starts_with("```") {
        // Drop the opening fence line and a trailing fence if present.
        text = text.splitn(2, '\n').nth(1).unwrap_or("");
        if let Some(end) = text.rfind("```") {
            text = &text[..end];
        }
        text = text.trim();
    }

    let array_start = text.find('[');
    let object_start = text.find('{');
    let (start, close) = match (array_start, object_start) {
        (Some(a), Some(o)) if a < o => (Some(a), ']'),
        (Some(a), None) => (Some(a), ']'),
        (_, Some(o)) => (Some(o), '}'),
        (None, None) => (None, ' '),
    };
    match (start, text.rfind(close)) {
        (Some(s), Some(e)) if e >= s => text[s..=e].to_string(),
        _ => text.to_string(),
    }
}

/// Scripted client for tests and offline runs.
pub struct MockChatClient {
    responses: parking_lot::Mutex<Vec<String>>,
}

impl MockChatClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: parking_lot::Mutex::new(responses),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn complete(&self, _system: &str, _user: &str, _timeout: Duration) -> TradingResult<String> {
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            return Err(TradingError::LlmError("mock exhausted".to_string()));
        }
        Ok(responses.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_fences_and_prose() {
        let fenced = "```json\n[{\"symbol\": \"BTC\"}]\n```";
        assert_eq!(extract_json(fenced), "[{\"symbol\": \"BTC\"}]");

        let prose = "Here are my conditions:\n[{\"symbol\": \"ETH\"}]\nGood luck!";
        assert_eq!(extract_json(prose), "[{\"symbol\": \"ETH\"}]");

        let object = "```\n{\"summary\": \"ok\", \"insights\": []}\n```";
        assert_eq!(extract_json(object), "{\"summary\": \"ok\", \"insights\": []}");
    }

    #[test]
    fn extract_json_prefers_the_first_value() {
        // An object that contains an array keeps the object brackets.
        let mixed = "{\"insights\": [1, 2]}";
        assert_eq!(extract_json(mixed), mixed);
    }

    #[tokio::test]
    async fn http_client_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"[]"}}]}"#)
            .create_async()
            .await;

        let config = LlmConfig {
            endpoint: format!("{}/v1/chat/completions", server.url()),
            model: "test-model".to_string(),
            api_key_env: String::new(),
        };
        let client = HttpChatClient::new(&config).unwrap();
        let reply = client
            .complete("system", "user", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "[]");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_client_surfaces_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let config = LlmConfig {
            endpoint: format!("{}/v1/chat/completions", server.url()),
            model: "test-model".to_string(),
            api_key_env: String::new(),
        };
        let client = HttpChatClient::new(&config).unwrap();
        let err = client
            .complete("system", "user", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::LlmError(_)));
    }
}
