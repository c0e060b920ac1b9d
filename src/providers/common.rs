use std::future::Future;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::abort::AbortHandle;
use crate::error::LlmuxError;
use crate::providers::SinkRef;
use crate::types::BackendName;

/// Cap on error bodies read into a failure description.
pub const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Shared HTTP client for all adapters. Only the connect phase is bounded;
/// streams run until they finish or are aborted.
pub fn http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("failed to build tuned HTTP client, using defaults: {e}");
            Client::new()
        })
}

pub fn missing_api_key(backend: BackendName) -> LlmuxError {
    LlmuxError::Configuration {
        backend: backend.to_string(),
        message: format!("{} API key not set", backend.title()),
    }
}

pub fn missing_endpoint(backend: BackendName) -> LlmuxError {
    LlmuxError::Configuration {
        backend: backend.to_string(),
        message: format!("{} endpoint not set", backend.title()),
    }
}

/// Failure to connect or to read the body mid-stream.
pub fn transport_failure(backend: BackendName, e: impl std::fmt::Display) -> LlmuxError {
    LlmuxError::BackendFailure {
        backend: backend.to_string(),
        message: e.to_string(),
        status: None,
    }
}

pub fn parse_failure(backend: BackendName, e: impl std::fmt::Display) -> LlmuxError {
    LlmuxError::BackendFailure {
        backend: backend.to_string(),
        message: format!("malformed stream chunk: {e}"),
        status: None,
    }
}

/// Read a capped error body from a non-success response.
pub async fn read_error_body(response: Response) -> (StatusCode, String) {
    let status = response.status();
    let bytes = response.bytes().await.unwrap_or_default();
    let truncated = &bytes[..bytes.len().min(MAX_ERROR_BODY_BYTES)];
    (status, String::from_utf8_lossy(truncated).trim().to_string())
}

/// 401/403 become `InvalidCredential`; everything else keeps status and body.
pub fn classify_status(backend: BackendName, status: StatusCode, body: &str) -> LlmuxError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return LlmuxError::InvalidCredential {
            backend: backend.to_string(),
            message: format!("{status}"),
        };
    }
    let message = if body.is_empty() {
        format!("{status}")
    } else {
        format!("{status}: {body}")
    };
    LlmuxError::BackendFailure {
        backend: backend.to_string(),
        message,
        status: Some(status.as_u16()),
    }
}

/// Send a prepared request and classify any non-success status.
pub async fn send_checked(
    backend: BackendName,
    request: reqwest::RequestBuilder,
) -> Result<Response, LlmuxError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_failure(backend, e))?;
    if response.status().is_success() {
        return Ok(response);
    }
    let (status, body) = read_error_body(response).await;
    Err(classify_status(backend, status, &body))
}

/// Running `fullTextSoFar` for one stream.
#[derive(Debug, Default)]
pub struct TextAccumulator {
    full: String,
}

impl TextAccumulator {
    /// Append a delta and return the new full text. Empty deltas are skipped.
    pub fn push(&mut self, delta: &str) -> Option<&str> {
        if delta.is_empty() {
            return None;
        }
        self.full.push_str(delta);
        Some(&self.full)
    }

    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn into_string(self) -> String {
        self.full
    }
}

/// Splits a byte stream into complete `\n`-terminated lines. Multi-byte
/// characters split across chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Outcome of an adapter's stream task.
pub enum StreamEnd {
    /// The backend signalled completion (or the stream simply ended).
    Complete(String),
    /// The abort handle fired; nothing more is reported.
    Cancelled,
}

/// Register an abort handle, then drive `stream` on the runtime and report
/// its outcome to `sink`.
///
/// The abort handle cancels a per-call token; the stream future is dropped at
/// its next await point, which drops the HTTP response and closes the
/// connection. A panic inside the stream task is reported as an adapter fault.
pub fn spawn_stream<F>(backend: BackendName, sink: SinkRef, stream: F)
where
    F: Future<Output = Result<String, LlmuxError>> + Send + 'static,
{
    let token = CancellationToken::new();
    let abort_token = token.clone();
    sink.register_abort_handle(AbortHandle::new(move || abort_token.cancel()));

    let task_sink = sink.clone();
    let task = tokio::spawn(async move {
        let end = tokio::select! {
            biased;
            _ = token.cancelled() => Ok(StreamEnd::Cancelled),
            result = stream => result.map(StreamEnd::Complete),
        };
        match end {
            Ok(StreamEnd::Complete(text)) => task_sink.on_final_message(&text),
            Ok(StreamEnd::Cancelled) => {
                tracing::debug!(backend = %backend, "stream cancelled");
            }
            Err(e) => task_sink.on_error(e),
        }
    });

    tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                tracing::error!(backend = %backend, "stream task panicked");
                sink.on_error(LlmuxError::AdapterFault {
                    backend: backend.to_string(),
                    message: "stream task panicked".to_string(),
                });
            }
        }
    });
}

/// Uppercase the first character, leave the rest alone.
pub fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_401_and_403_as_invalid_credential() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = classify_status(BackendName::OpenAi, status, "nope");
            assert!(matches!(err, LlmuxError::InvalidCredential { .. }));
        }
    }

    #[test]
    fn classify_other_status_keeps_body() {
        let err = classify_status(BackendName::Groq, StatusCode::TOO_MANY_REQUESTS, "slow down");
        match err {
            LlmuxError::BackendFailure {
                message, status, ..
            } => {
                assert_eq!(status, Some(429));
                assert!(message.contains("slow down"));
            }
            other => panic!("expected BackendFailure, got {other:?}"),
        }
    }

    #[test]
    fn accumulator_tracks_full_text() {
        let mut acc = TextAccumulator::default();
        assert_eq!(acc.push("H"), Some("H"));
        assert_eq!(acc.push(""), None);
        assert_eq!(acc.push("ello"), Some("Hello"));
        assert_eq!(acc.into_string(), "Hello");
    }

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"{\"a\":").is_empty());
        let lines = buf.push(b"1}\n{\"b\":2}\n\n{\"c\"");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buf.push(b":3}"), Vec::<String>::new());
        assert_eq!(buf.finish().as_deref(), Some("{\"c\":3}"));
    }

    #[test]
    fn line_buffer_handles_multibyte_split() {
        let mut buf = LineBuffer::default();
        let bytes = "é\n".as_bytes();
        assert!(buf.push(&bytes[..1]).is_empty());
        assert_eq!(buf.push(&bytes[1..]), vec!["é"]);
    }

    #[test]
    fn capitalize_first_only_touches_first_char() {
        assert_eq!(capitalize_first("model 'x' not found"), "Model 'x' not found");
        assert_eq!(capitalize_first(""), "");
    }
}
