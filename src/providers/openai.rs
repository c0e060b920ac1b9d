use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::LlmuxError;
use crate::providers::common::{
    TextAccumulator, classify_status, http_client, missing_api_key, missing_endpoint,
    parse_failure, read_error_body, spawn_stream, transport_failure,
};
use crate::providers::{ChatCall, ProviderAdapter, SinkRef};
use crate::types::BackendName;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

const OPENROUTER_REFERER: &str = "https://github.com/llmux/llmux";
const OPENROUTER_TITLE: &str = "llmux";

/// Chat-completions SSE adapter shared by every OpenAI-shaped backend
/// (`openAI`, `openRouter`, `deepseek`, `groq`, `openAICompatible`).
/// System messages stay inline in the message array.
pub struct OpenAiAdapter {
    client: Client,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    /// OpenRouter reports mid-stream failures inside a data event.
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    param: Option<String>,
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Resolve the base URL and API key for `call.backend`. Configuration
    /// problems come back as `Err` and are reported through the sink.
    fn resolve(call: &ChatCall) -> Result<(String, Option<String>), LlmuxError> {
        let settings = &call.settings;
        let backend = call.backend;
        let key = settings.api_key().map(str::to_string);
        let default_base = match backend {
            BackendName::OpenAi => OPENAI_BASE_URL,
            BackendName::OpenRouter => OPENROUTER_BASE_URL,
            BackendName::DeepSeek => DEEPSEEK_BASE_URL,
            BackendName::Groq => GROQ_BASE_URL,
            BackendName::OpenAiCompatible => {
                let endpoint = settings.endpoint().ok_or_else(|| missing_endpoint(backend))?;
                return Ok((endpoint.to_string(), key));
            }
            other => {
                return Err(LlmuxError::AdapterFault {
                    backend: other.to_string(),
                    message: "not an OpenAI-compatible backend".to_string(),
                });
            }
        };
        let key = key.ok_or_else(|| missing_api_key(backend))?;
        let base = settings.endpoint().unwrap_or(default_base).to_string();
        Ok((base, Some(key)))
    }

    fn request_body(call: &ChatCall) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = call
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut body = serde_json::json!({
            "model": call.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(max_tokens) = call.settings.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError> {
        let (base_url, api_key) = match Self::resolve(call) {
            Ok(resolved) => resolved,
            Err(e @ LlmuxError::Configuration { .. }) => {
                sink.on_error(e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let backend = call.backend;
        let model = call.model.clone();
        let mut request = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .header("Content-Type", "application/json")
            .json(&Self::request_body(call));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }
        if backend == BackendName::OpenRouter {
            request = request
                .header("HTTP-Referer", OPENROUTER_REFERER)
                .header("X-Title", OPENROUTER_TITLE);
        }

        let stream_sink = sink.clone();
        spawn_stream(backend, sink, async move {
            let response = request
                .send()
                .await
                .map_err(|e| transport_failure(backend, e))?;

            if !response.status().is_success() {
                let (status, body) = read_error_body(response).await;
                return Err(normalize_error(backend, &model, status, &body));
            }

            let mut events = response.bytes_stream().eventsource();
            let mut text = TextAccumulator::default();
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| transport_failure(backend, e))?;
                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    break;
                }
                let chunk: ChatCompletionChunk =
                    serde_json::from_str(data).map_err(|e| parse_failure(backend, e))?;
                if let Some(err) = chunk.error {
                    return Err(chunk_error(backend, err));
                }
                let delta = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content);
                if let Some(delta) = delta {
                    if let Some(full) = text.push(&delta) {
                        stream_sink.on_text(&delta, full);
                    }
                }
            }
            Ok(text.into_string())
        });
        Ok(())
    }
}

/// Map an error response to the normalized taxonomy.
fn normalize_error(backend: BackendName, model: &str, status: StatusCode, body: &str) -> LlmuxError {
    if status == StatusCode::BAD_REQUEST {
        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
            if envelope.error.param.as_deref() == Some("stream") {
                return LlmuxError::BackendFailure {
                    backend: backend.to_string(),
                    message: format!("The model '{model}' does not support streamed responses."),
                    status: Some(status.as_u16()),
                };
            }
            if let Some(message) = envelope.error.message {
                return LlmuxError::BackendFailure {
                    backend: backend.to_string(),
                    message,
                    status: Some(status.as_u16()),
                };
            }
        }
    }
    classify_status(backend, status, body)
}

fn chunk_error(backend: BackendName, err: ChunkError) -> LlmuxError {
    let message = err.message.unwrap_or_else(|| "stream error".to_string());
    let code = err.code.as_ref().and_then(|c| c.as_u64());
    if code == Some(401) || code == Some(403) {
        return LlmuxError::InvalidCredential {
            backend: backend.to_string(),
            message,
        };
    }
    LlmuxError::BackendFailure {
        backend: backend.to_string(),
        message,
        status: code.and_then(|c| u16::try_from(c).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, ProviderSettings};

    fn call(backend: BackendName, settings: ProviderSettings) -> ChatCall {
        ChatCall {
            backend,
            model: "gpt-test".to_string(),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            settings,
        }
    }

    #[test]
    fn openai_requires_api_key() {
        let err = OpenAiAdapter::resolve(&call(BackendName::OpenAi, ProviderSettings::default()))
            .unwrap_err();
        assert_eq!(err.description(), "OpenAI API key not set");
    }

    #[test]
    fn compatible_requires_endpoint_but_not_key() {
        let err = OpenAiAdapter::resolve(&call(
            BackendName::OpenAiCompatible,
            ProviderSettings::default(),
        ))
        .unwrap_err();
        assert_eq!(err.description(), "OpenAI-compatible endpoint not set");

        let (base, key) = OpenAiAdapter::resolve(&call(
            BackendName::OpenAiCompatible,
            ProviderSettings {
                endpoint: Some("http://localhost:8000/v1/".to_string()),
                ..Default::default()
            },
        ))
        .unwrap();
        assert_eq!(base, "http://localhost:8000/v1");
        assert!(key.is_none());
    }

    #[test]
    fn hosted_backends_use_their_default_base_url() {
        let settings = ProviderSettings {
            api_key: Some("k".to_string()),
            ..Default::default()
        };
        let cases = [
            (BackendName::OpenAi, OPENAI_BASE_URL),
            (BackendName::OpenRouter, OPENROUTER_BASE_URL),
            (BackendName::DeepSeek, DEEPSEEK_BASE_URL),
            (BackendName::Groq, GROQ_BASE_URL),
        ];
        for (backend, expected) in cases {
            let (base, _) = OpenAiAdapter::resolve(&call(backend, settings.clone())).unwrap();
            assert_eq!(base, expected);
        }
    }

    #[test]
    fn body_keeps_system_inline_and_streams() {
        let settings = ProviderSettings {
            max_tokens: Some(256),
            ..Default::default()
        };
        let body = OpenAiAdapter::request_body(&call(BackendName::OpenAi, settings));
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[test]
    fn stream_param_400_gets_friendly_message() {
        let body = r#"{"error":{"message":"stream not supported","param":"stream"}}"#;
        let err = normalize_error(BackendName::OpenAi, "o1", StatusCode::BAD_REQUEST, body);
        assert_eq!(
            err.description(),
            "openAI: The model 'o1' does not support streamed responses."
        );
    }
}
