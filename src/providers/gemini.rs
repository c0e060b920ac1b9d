use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::LlmuxError;
use crate::providers::common::{
    TextAccumulator, classify_status, http_client, missing_api_key, parse_failure,
    read_error_body, spawn_stream, transport_failure,
};
use crate::providers::{ChatCall, ProviderAdapter, SinkRef};
use crate::types::{BackendName, Role};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Alternate-turn adapter for the Generative Language API.
///
/// Turns are `user`/`model` and must alternate, so consecutive messages with
/// the same role are merged. System messages go to `systemInstruction`.
pub struct GeminiAdapter {
    client: Client,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: Option<String>,
    status: Option<String>,
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            client: http_client(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// `(role, text)` turns with same-role neighbours merged.
    fn alternate_turns(call: &ChatCall) -> Vec<(&'static str, String)> {
        let mut turns: Vec<(&'static str, String)> = Vec::new();
        for message in call.turns() {
            let role = if message.role == Role::Assistant {
                "model"
            } else {
                "user"
            };
            match turns.last_mut() {
                Some((last_role, text)) if *last_role == role => {
                    text.push_str("\n\n");
                    text.push_str(&message.content);
                }
                _ => turns.push((role, message.content.clone())),
            }
        }
        turns
    }

    fn request_body(call: &ChatCall) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = Self::alternate_turns(call)
            .into_iter()
            .map(|(role, text)| serde_json::json!({"role": role, "parts": [{"text": text}]}))
            .collect();
        let mut body = serde_json::json!({ "contents": contents });
        if let Some(system) = call.system_prompt() {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
        }
        if let Some(max_tokens) = call.settings.max_tokens {
            body["generationConfig"] = serde_json::json!({"maxOutputTokens": max_tokens});
        }
        body
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError> {
        let backend = BackendName::Gemini;
        let Some(api_key) = call.settings.api_key() else {
            sink.on_error(missing_api_key(backend));
            return Ok(());
        };
        let base_url = call.settings.endpoint().unwrap_or(GEMINI_BASE_URL);
        let request = self
            .client
            .post(format!(
                "{base_url}/models/{}:streamGenerateContent?alt=sse",
                call.model
            ))
            .header("x-goog-api-key", api_key)
            .header("Content-Type", "application/json")
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

            let mut events = response.bytes_stream().eventsource();
            let mut text = TextAccumulator::default();
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| transport_failure(backend, e))?;
                if event.data.trim().is_empty() {
                    continue;
                }
                let chunk: GenerateChunk =
                    serde_json::from_str(&event.data).map_err(|e| parse_failure(backend, e))?;
                if let Some(err) = chunk.error {
                    return Err(LlmuxError::BackendFailure {
                        backend: backend.to_string(),
                        message: err
                            .message
                            .or(err.status)
                            .unwrap_or_else(|| "stream error".to_string()),
                        status: None,
                    });
                }
                let delta: String = chunk
                    .candidates
                    .into_iter()
                    .next()
                    .and_then(|c| c.content)
                    .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
                    .unwrap_or_default();
                if let Some(full) = text.push(&delta) {
                    stream_sink.on_text(&delta, full);
                }
            }
            Ok(text.into_string())
        });
        Ok(())
    }
}

/// Gemini answers a bad key with 400 + `API_KEY_INVALID` rather than 401.
fn normalize_error(status: StatusCode, body: &str) -> LlmuxError {
    let backend = BackendName::Gemini;
    if body.contains("API_KEY_INVALID") {
        return LlmuxError::InvalidCredential {
            backend: backend.to_string(),
            message: "API_KEY_INVALID".to_string(),
        };
    }
    classify_status(backend, status, body)
}
