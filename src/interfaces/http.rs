//! HTTP collaborators: a messaging gateway transport and an
//! OpenAI-compatible chat completions generator.
//!
//! ## Gateway endpoints
//!
//! ```text
//! POST {base}/messages  { "conversation_id": "...", "text": "..." }
//! POST {base}/presence  { "conversation_id": "...", "state": "composing" | "paused" }
//! POST {base}/read      { "conversation_id": "..." }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{MessageTransport, ResponseGenerator};
use crate::error::CollaboratorError;
use crate::types::{ConversationId, ConversationProfile, LogicalTurn, TurnLabels};

// ============================================================================
// Transport
// ============================================================================

/// Per-request timeout for gateway calls.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends messages through a messaging gateway's REST API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CollaboratorError> {
        Self::with_timeout(base_url, DEFAULT_GATEWAY_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, id: &ConversationId, path: &str, body: Value) -> Result<(), CollaboratorError> {
        let mut request = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let detail = response.text().await.unwrap_or_default();
            Err(CollaboratorError::delivery(
                id,
                format!("gateway {} returned {}: {}", path, status, detail),
            ))
        }
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn send(&self, id: &ConversationId, text: &str) -> Result<(), CollaboratorError> {
        self.post(id, "messages", json!({ "conversation_id": id, "text": text }))
            .await
    }

    async fn set_typing(&self, id: &ConversationId, on: bool) -> Result<(), CollaboratorError> {
        let state = if on { "composing" } else { "paused" };
        self.post(id, "presence", json!({ "conversation_id": id, "state": state }))
            .await
    }

    async fn mark_read(&self, id: &ConversationId) -> Result<(), CollaboratorError> {
        self.post(id, "read", json!({ "conversation_id": id })).await
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Chat completions settings.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "Você é um atendente simpático e objetivo. Responda em mensagens curtas, \
                            como numa conversa de WhatsApp."
                .to_string(),
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        }
    }
}

impl GeneratorSettings {
    /// Read `LLM_API_KEY`, `LLM_BASE_URL`, `LLM_MODEL` and
    /// `LLM_SYSTEM_PROMPT`, keeping defaults for anything unset.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            settings.api_key = key;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            settings.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            settings.model = model;
        }
        if let Ok(prompt) = std::env::var("LLM_SYSTEM_PROMPT") {
            settings.system_prompt = prompt;
        }
        settings
    }
}

/// Generates replies with an OpenAI-compatible `/chat/completions` call.
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
    http: reqwest::Client,
    settings: GeneratorSettings,
}

impl ChatCompletionsGenerator {
    pub fn new(settings: GeneratorSettings) -> Result<Self, CollaboratorError> {
        let http = reqwest::Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { http, settings })
    }

    pub fn settings(&self) -> &GeneratorSettings {
        &self.settings
    }

    /// Request body for one turn.
    pub fn build_request(&self, turn: &LogicalTurn, labels: &TurnLabels, profile: &ConversationProfile) -> Value {
        let hints = format!(
            "Perfil do cliente: {}. Sentimento: {:?}. Urgência: {:?}. Turnos anteriores: {}.",
            labels.archetype, labels.sentiment, labels.urgency, profile.turns
        );
        json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "messages": [
                { "role": "system", "content": self.settings.system_prompt },
                { "role": "system", "content": hints },
                { "role": "user", "content": turn.text },
            ],
        })
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionsGenerator {
    async fn generate(
        &self,
        turn: &LogicalTurn,
        labels: &TurnLabels,
        profile: &ConversationProfile,
    ) -> Result<String, CollaboratorError> {
        let body = self.build_request(turn, labels, profile);
        let response = self
            .http
            .post(format!("{}/chat/completions", self.settings.base_url))
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Generator(format!(
                "completions API returned {}: {}",
                status, detail
            )));
        }

        let json: Value = response.json().await?;
        extract_reply(&json)
    }
}

/// Pull `choices[0].message.content` out of a completions response.
pub fn extract_reply(json: &Value) -> Result<String, CollaboratorError> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| CollaboratorError::Generator("response has no message content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fragment;

    #[test]
    fn test_transport_trims_trailing_slash() {
        let transport = HttpTransport::new("http://gateway:3000/").unwrap().with_token("t");
        assert_eq!(transport.base_url(), "http://gateway:3000");
        assert_eq!(transport.timeout(), DEFAULT_GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_unresponsive_gateway_times_out() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let transport =
            HttpTransport::with_timeout(format!("http://{}", addr), Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), transport.send(&"c".into(), "oi")).await;
        assert!(matches!(result, Ok(Err(CollaboratorError::Http(_)))));
        server.abort();
    }

    #[test]
    fn test_extract_reply() {
        let json = json!({ "choices": [{ "message": { "content": "  Oi! Tudo bem?\n" } }] });
        assert_eq!(extract_reply(&json).unwrap(), "Oi! Tudo bem?");

        let err = extract_reply(&json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, CollaboratorError::Generator(_)));
    }

    #[test]
    fn test_request_carries_turn_and_labels() {
        let generator = ChatCompletionsGenerator::new(GeneratorSettings {
            model: "test-model".to_string(),
            ..GeneratorSettings::default()
        })
        .unwrap();
        let turn = LogicalTurn::single("c".into(), Fragment::text("quanto custa?"));
        let body = generator.build_request(&turn, &TurnLabels::default(), &ConversationProfile::default());

        assert_eq!(body["model"], "test-model");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"], "quanto custa?");
    }
}
