use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;

use crate::error::LlmuxError;
use crate::providers::common::{
    TextAccumulator, http_client, missing_api_key, parse_failure, send_checked, spawn_stream,
    transport_failure,
};
use crate::providers::{ChatCall, ProviderAdapter, SinkRef};
use crate::types::BackendName;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Messages-API SSE adapter. System messages travel in the separate `system`
/// field; text arrives as `content_block_delta` events and the stream ends
/// with `message_stop`.
pub struct AnthropicAdapter {
    client: Client,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEventData {
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Output ceiling for models we know, used when settings carry no
/// `max_tokens`.
pub fn default_max_tokens(model: &str) -> Option<u64> {
    let model = model.to_ascii_lowercase();
    let long_output = [
        "claude-3-5",
        "claude-3.5",
        "claude-3-7",
        "claude-3.7",
        "claude-sonnet-4",
        "claude-opus-4",
        "claude-haiku-4",
    ];
    if long_output.iter().any(|p| model.starts_with(p)) {
        Some(8192)
    } else if model.starts_with("claude-3") {
        Some(4096)
    } else {
        None
    }
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn request_body(call: &ChatCall, max_tokens: u64) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = call
            .turns()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut body = serde_json::json!({
            "model": call.model,
            "max_tokens": max_tokens,
            "messages": messages,
            "stream": true,
        });
        if let Some(system) = call.system_prompt() {
            body["system"] = serde_json::json!(system);
        }
        body
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError> {
        let backend = BackendName::Anthropic;
        let Some(api_key) = call.settings.api_key() else {
            sink.on_error(missing_api_key(backend));
            return Ok(());
        };
        let Some(max_tokens) = call
            .settings
            .max_tokens
            .or_else(|| default_max_tokens(&call.model))
        else {
            sink.on_error(LlmuxError::Configuration {
                backend: backend.to_string(),
                message: "Please set a value for Max Tokens.".to_string(),
            });
            return Ok(());
        };

        let base_url = call.settings.endpoint().unwrap_or(ANTHROPIC_BASE_URL);
        let request = self
            .client
            .post(format!("{base_url}/v1/messages"))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&Self::request_body(call, max_tokens));

        let stream_sink = sink.clone();
        spawn_stream(backend, sink, async move {
            let response = send_checked(backend, request).await?;
            let mut events = response.bytes_stream().eventsource();
            let mut text = TextAccumulator::default();
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| transport_failure(backend, e))?;
                if event.data.trim().is_empty() {
                    continue;
                }
                let data: StreamEventData =
                    serde_json::from_str(&event.data).map_err(|e| parse_failure(backend, e))?;
                match data {
                    StreamEventData::ContentBlockDelta {
                        delta: BlockDelta::TextDelta { text: delta },
                    } => {
                        if let Some(full) = text.push(&delta) {
                            stream_sink.on_text(&delta, full);
                        }
                    }
                    StreamEventData::MessageStop => break,
                    StreamEventData::Error { error } => return Err(api_error(backend, error)),
                    _ => {}
                }
            }
            Ok(text.into_string())
        });
        Ok(())
    }
}

fn api_error(backend: BackendName, error: ApiError) -> LlmuxError {
    if error.kind == "authentication_error" || error.kind == "permission_error" {
        return LlmuxError::InvalidCredential {
            backend: backend.to_string(),
            message: error.message,
        };
    }
    LlmuxError::BackendFailure {
        backend: backend.to_string(),
        message: format!("{}: {}", error.kind, error.message),
        status: None,
    }
}
