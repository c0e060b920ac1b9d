use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, LlmuxError};

/// Opaque request token. The only key used to correlate events across the
/// transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed set of backends a request may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendName {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openAI")]
    OpenAi,
    #[serde(rename = "openRouter")]
    OpenRouter,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "groq")]
    Groq,
    #[serde(rename = "openAICompatible")]
    OpenAiCompatible,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "ollama")]
    Ollama,
}

impl BackendName {
    pub const ALL: [BackendName; 8] = [
        Self::Anthropic,
        Self::OpenAi,
        Self::OpenRouter,
        Self::DeepSeek,
        Self::Groq,
        Self::OpenAiCompatible,
        Self::Gemini,
        Self::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openAI",
            Self::OpenRouter => "openRouter",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::OpenAiCompatible => "openAICompatible",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }

    /// Human-facing provider title used in configuration error messages.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Anthropic => "Anthropic",
            Self::OpenAi => "OpenAI",
            Self::OpenRouter => "OpenRouter",
            Self::DeepSeek => "DeepSeek",
            Self::Groq => "Groq",
            Self::OpenAiCompatible => "OpenAI-compatible",
            Self::Gemini => "Gemini",
            Self::Ollama => "Ollama",
        }
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendName {
    type Err = LlmuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| LlmuxError::UnknownBackend {
                name: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Backend credentials and tuning. Opaque to the lifecycle controller; each
/// adapter reads the fields it needs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Base URL override. Required for `ollama` and `openAICompatible`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl ProviderSettings {
    /// Fill unset fields from `defaults`. Fields set on `self` win.
    pub fn merged_over(&self, defaults: &ProviderSettings) -> ProviderSettings {
        ProviderSettings {
            api_key: self.api_key.clone().or_else(|| defaults.api_key.clone()),
            endpoint: self.endpoint.clone().or_else(|| defaults.endpoint.clone()),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
        }
    }

    /// Non-empty API key, if any.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Non-empty endpoint with any trailing slash removed.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(|e| e.trim().trim_end_matches('/'))
            .filter(|e| !e.is_empty())
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("endpoint", &self.endpoint)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_feature() -> String {
    "Chat".to_string()
}

/// A request as it crosses the transport boundary: plain data only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Raw backend name; validated against [`BackendName`] at submit time.
    pub backend: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub settings: ProviderSettings,
    /// Logging name of the calling feature, prefixed to metrics event names.
    #[serde(default = "default_feature")]
    pub feature: String,
}

impl ChatRequest {
    pub fn new(backend: impl Into<String>, model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            messages,
            settings: ProviderSettings::default(),
            feature: default_feature(),
        }
    }

    pub fn with_settings(mut self, settings: ProviderSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = feature.into();
        self
    }
}

/// Request state machine. `Finalized`, `Errored` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Streaming,
    Finalized,
    Errored,
    Aborted,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Errored | Self::Aborted)
    }
}

/// The three named broadcast channels of the transport bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "on_text")]
    Text,
    #[serde(rename = "on_final_message")]
    FinalMessage,
    #[serde(rename = "on_error")]
    Error,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "on_text",
            Self::FinalMessage => "on_final_message",
            Self::Error => "on_error",
        }
    }
}

/// Normalized streaming event, always tagged with the originating request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        request_id: RequestId,
        new_text: String,
        full_text: String,
    },
    FinalMessage {
        request_id: RequestId,
        full_text: String,
    },
    Error {
        request_id: RequestId,
        error: ChatError,
    },
}

impl StreamEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::TextDelta { request_id, .. } => request_id,
            Self::FinalMessage { request_id, .. } => request_id,
            Self::Error { request_id, .. } => request_id,
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::TextDelta { .. } => Channel::Text,
            Self::FinalMessage { .. } => Channel::FinalMessage,
            Self::Error { .. } => Channel::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TextDelta { .. })
    }
}
