use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::LlmuxError;
use crate::providers::common::{
    LineBuffer, TextAccumulator, capitalize_first, classify_status, http_client,
    missing_endpoint, parse_failure, read_error_body, spawn_stream, transport_failure,
};
use crate::providers::{ChatCall, ProviderAdapter, SinkRef};
use crate::types::BackendName;

/// Local-inference adapter for Ollama's `/api/chat`.
///
/// The response is line-delimited JSON; each line carries a content delta and
/// the last one has `done: true`. There is no default endpoint: an empty one
/// is a configuration error rather than a silent fallback to localhost.
pub struct OllamaAdapter {
    client: Client,
}

#[derive(Deserialize)]
struct ChatLine {
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl Default for OllamaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaAdapter {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
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
            body["options"] = serde_json::json!({"num_predict": max_tokens});
        }
        body
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError> {
        let backend = BackendName::Ollama;
        let Some(endpoint) = call.settings.endpoint() else {
            sink.on_error(missing_endpoint(backend));
            return Ok(());
        };
        let request = self
            .client
            .post(format!("{endpoint}/api/chat"))
            .json(&Self::request_body(call));

        let stream_sink = sink.clone();
        spawn_stream(backend, sink, async move {
            let response = request
                .send()
                .await
                .map_err(|e| transport_failure(backend, e))?;
            if !response.status().is_success() {
                let (status, body) = read_error_body(response).await;
                return Err(normalize_error(status, &body));
            }

            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::default();
            let mut text = TextAccumulator::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| transport_failure(backend, e))?;
                for line in lines.push(&chunk) {
                    if handle_line(&line, &mut text, &*stream_sink)? {
                        return Ok(text.into_string());
                    }
                }
            }
            if let Some(line) = lines.finish() {
                handle_line(&line, &mut text, &*stream_sink)?;
            }
            Ok(text.into_string())
        });
        Ok(())
    }
}

/// Apply one NDJSON line. Returns `true` once the `done` line is seen.
fn handle_line(
    line: &str,
    text: &mut TextAccumulator,
    sink: &dyn crate::providers::ChatSink,
) -> Result<bool, LlmuxError> {
    let backend = BackendName::Ollama;
    let parsed: ChatLine = serde_json::from_str(line).map_err(|e| parse_failure(backend, e))?;
    if let Some(error) = parsed.error {
        return Err(LlmuxError::BackendFailure {
            backend: backend.to_string(),
            message: capitalize_first(&error),
            status: None,
        });
    }
    if let Some(message) = parsed.message {
        if let Some(full) = text.push(&message.content) {
            sink.on_text(&message.content, full);
        }
    }
    Ok(parsed.done)
}

fn normalize_error(status: StatusCode, body: &str) -> LlmuxError {
    let backend = BackendName::Ollama;
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN => {
            LlmuxError::BackendFailure {
                backend: backend.to_string(),
                message: capitalize_first(&parsed.error),
                status: Some(status.as_u16()),
            }
        }
        _ => classify_status(backend, status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_is_capitalized() {
        let err = normalize_error(StatusCode::NOT_FOUND, r#"{"error":"model 'nope' not found"}"#);
        assert_eq!(err.description(), "ollama: Model 'nope' not found");
    }

    #[test]
    fn proxy_401_is_invalid_credential() {
        let err = normalize_error(StatusCode::UNAUTHORIZED, r#"{"error":"unauthorized"}"#);
        assert!(matches!(err, LlmuxError::InvalidCredential { .. }));
    }
}
