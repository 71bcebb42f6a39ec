//! Chat capability: providers and routing.
//!
//! The engine only needs `chat(request) -> response`. A [`ChatRouter`]
//! holds the registered [`ChatProvider`]s and picks one per request:
//!
//! | `request.provider` | Resolution |
//! |--------------------|------------|
//! | a registered id | that provider |
//! | an unknown id | [`MockProvider`] |
//! | `"auto"` | first available of `anthropic`, `openai` that supports the model, else any available provider, else mock |
//!
//! A provider without credentials does not fail: it answers with a
//! degraded response whose `warn` is [`PROVIDER_UNAVAILABLE`]. Transport
//! and API errors are returned as errors.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ChatConfig;

pub const PROVIDER_UNAVAILABLE: &str = "provider_unavailable";

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MAX_TOKENS: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    fn last_turn(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role != Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub provider: String,
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn: Option<String>,
}

impl ChatResponse {
    fn unavailable(provider: &str, model: &str, reason: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            content: reason.to_string(),
            usage: None,
            warn: Some(PROVIDER_UNAVAILABLE.to_string()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.warn.is_some()
    }
}

/// A chat backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;
    /// Whether the provider can serve requests (credentials present).
    fn available(&self) -> bool;
    fn supports(&self, model: &str) -> bool;
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

// ============ Mock ============

/// Deterministic offline provider. Echoes the last non-system turn.
#[derive(Debug, Default)]
pub struct MockProvider;

#[async_trait]
impl ChatProvider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }
    fn available(&self) -> bool {
        true
    }
    fn supports(&self, _model: &str) -> bool {
        true
    }
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        Ok(ChatResponse {
            provider: "mock".to_string(),
            model: request.model.clone(),
            content: format!("[MOCK] {}", request.last_turn()),
            usage: None,
            warn: None,
        })
    }
}

// ============ Anthropic ============

pub struct AnthropicProvider {
    client: Client,
    api_key: Option<String>,
    url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            url: url.unwrap_or_else(|| ANTHROPIC_API_URL.to_string()),
        })
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        Self::new(
            std::env::var("ANTHROPIC_API_KEY").ok(),
            config.anthropic_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Short aliases accepted from operators.
    fn resolve_model(model: &str) -> &str {
        match model {
            "claude-sonnet-4" => "claude-sonnet-4-20250514",
            "claude-3.5-sonnet" | "claude-3.5-sonnet-latest" => "claude-3-5-sonnet-20241022",
            other => other,
        }
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }
    fn available(&self) -> bool {
        self.api_key.is_some()
    }
    fn supports(&self, model: &str) -> bool {
        Self::resolve_model(model).to_lowercase().starts_with("claude")
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let Some(key) = &self.api_key else {
            return Ok(ChatResponse::unavailable(
                self.id(),
                &request.model,
                "(no ANTHROPIC_API_KEY set)",
            ));
        };
        let model = Self::resolve_model(&request.model);

        let turns: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                json!({ "role": role, "content": m.content })
            })
            .collect();
        let mut body = json!({
            "model": model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": turns,
        });
        if let Some(system) = request.system_prompt() {
            body["system"] = json!(system);
        }

        debug!(model, "anthropic request");
        let resp = self
            .client
            .post(&self.url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = resp.status();
        let text = resp.text().await.context("Failed to read Anthropic response")?;
        if !status.is_success() {
            bail!("Anthropic API error ({}): {}", status.as_u16(), text);
        }

        let parsed: AnthropicResponse =
            serde_json::from_str(&text).context("Malformed Anthropic response")?;
        let content = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ChatResponse {
            provider: self.id().to_string(),
            model: model.to_string(),
            content,
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            }),
            warn: None,
        })
    }
}

// ============ OpenAI ============

pub struct OpenAIProvider {
    client: Client,
    api_key: Option<String>,
    url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: Option<String>, url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            url: url.unwrap_or_else(|| OPENAI_API_URL.to_string()),
        })
    }

    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        Self::new(
            std::env::var("OPENAI_API_KEY").ok(),
            config.openai_url.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    fn id(&self) -> &str {
        "openai"
    }
    fn available(&self) -> bool {
        self.api_key.is_some()
    }
    fn supports(&self, model: &str) -> bool {
        let m = model.to_lowercase();
        m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4")
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let Some(key) = &self.api_key else {
            return Ok(ChatResponse::unavailable(
                self.id(),
                &request.model,
                "(no OPENAI_API_KEY set)",
            ));
        };

        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        debug!(model = %request.model, "openai request");
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("OpenAI request failed")?;

        let status = resp.status();
        let text = resp.text().await.context("Failed to read OpenAI response")?;
        if !status.is_success() {
            bail!("OpenAI API error ({}): {}", status.as_u16(), text);
        }

        let parsed: OpenAIResponse =
            serde_json::from_str(&text).context("Malformed OpenAI response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatResponse {
            provider: self.id().to_string(),
            model: request.model.clone(),
            content,
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            warn: None,
        })
    }
}

// ============ Router ============

fn mock() -> Arc<dyn ChatProvider> {
    Arc::new(MockProvider)
}

const AUTO_PREFERENCE: &[&str] = &["anthropic", "openai"];

/// Registry of chat providers with per-request resolution.
#[derive(Default, Clone)]
pub struct ChatRouter {
    providers: Vec<Arc<dyn ChatProvider>>,
}

impl ChatRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anthropic, OpenAI (keys from the environment) and the mock provider.
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let mut router = Self::new();
        router.register(Arc::new(AnthropicProvider::from_config(config)?));
        router.register(Arc::new(OpenAIProvider::from_config(config)?));
        router.register(Arc::new(MockProvider));
        Ok(router)
    }

    /// Add a provider. A later registration with the same id replaces the
    /// earlier one.
    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers.retain(|p| p.id() != provider.id());
        self.providers.push(provider);
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn resolve(&self, provider: &str, model: &str) -> Arc<dyn ChatProvider> {
        if provider != "auto" {
            return self.find(provider).unwrap_or_else(mock);
        }

        for id in AUTO_PREFERENCE {
            if let Some(p) = self.find(id) {
                if p.available() && p.supports(model) {
                    return p;
                }
            }
        }
        self.providers
            .iter()
            .find(|p| p.available())
            .cloned()
            .unwrap_or_else(mock)
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let provider = self.resolve(&request.provider, &request.model);
        debug!(
            requested = %request.provider,
            resolved = provider.id(),
            model = %request.model,
            "chat"
        );
        provider.chat(request).await
    }

    fn find(&self, id: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(provider: &str, model: &str) -> ChatRequest {
        ChatRequest {
            provider: provider.to_string(),
            model: model.to_string(),
            messages: vec![ChatMessage::system("be terse"), ChatMessage::user("hello there")],
            max_tokens: None,
        }
    }

    fn keyed_router(anthropic: Option<&str>, openai: Option<&str>) -> ChatRouter {
        let t = Duration::from_secs(5);
        let mut r = ChatRouter::new();
        r.register(Arc::new(
            AnthropicProvider::new(anthropic.map(String::from), None, t).unwrap(),
        ));
        r.register(Arc::new(
            OpenAIProvider::new(openai.map(String::from), None, t).unwrap(),
        ));
        r.register(Arc::new(MockProvider));
        r
    }

    #[tokio::test]
    async fn test_mock_echoes_last_turn() {
        let resp = MockProvider.chat(&request("mock", "m")).await.unwrap();
        assert_eq!(resp.content, "[MOCK] hello there");
        assert!(!resp.is_degraded());
    }

    #[test]
    fn test_explicit_and_unknown_ids() {
        let r = keyed_router(None, None);
        assert_eq!(r.resolve("openai", "gpt-4o").id(), "openai");
        assert_eq!(r.resolve("gemini", "x").id(), "mock");
    }

    #[test]
    fn test_auto_prefers_available_supporting_provider() {
        let r = keyed_router(Some("k1"), Some("k2"));
        assert_eq!(r.resolve("auto", "claude-sonnet-4").id(), "anthropic");
        assert_eq!(r.resolve("auto", "gpt-4o").id(), "openai");

        let only_openai = keyed_router(None, Some("k2"));
        assert_eq!(only_openai.resolve("auto", "claude-sonnet-4").id(), "openai");

        let none = keyed_router(None, None);
        assert_eq!(none.resolve("auto", "claude-sonnet-4").id(), "mock");
    }

    #[tokio::test]
    async fn test_unavailable_provider_degrades() {
        let r = keyed_router(None, None);
        let resp = r.chat(&request("anthropic", "claude-sonnet-4")).await.unwrap();
        assert_eq!(resp.warn.as_deref(), Some(PROVIDER_UNAVAILABLE));
        assert_eq!(resp.provider, "anthropic");
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mut r = ChatRouter::new();
        r.register(Arc::new(MockProvider));
        r.register(Arc::new(MockProvider));
        assert_eq!(r.provider_ids(), vec!["mock"]);
    }

    #[test]
    fn test_model_aliases() {
        assert_eq!(
            AnthropicProvider::resolve_model("claude-sonnet-4"),
            "claude-sonnet-4-20250514"
        );
        assert_eq!(AnthropicProvider::resolve_model("claude-opus-x"), "claude-opus-x");
    }
}
