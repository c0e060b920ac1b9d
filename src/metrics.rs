use std::sync::Mutex;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::types::{ChatMessage, Role};

pub const SENDING_MESSAGE: &str = "Sending Message";
pub const RECEIVED_FULL_MESSAGE: &str = "Received Full Message";
pub const ERROR: &str = "Error";
pub const ABORT: &str = "Abort";

/// `"<feature> - <event>"`, the name handed to the capture collaborator.
pub fn event_name(feature: &str, event: &str) -> String {
    format!("{feature} - {event}")
}

/// Role and length of one message. Never the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageShape {
    pub role: Role,
    pub length: usize,
}

/// Non-content statistics about a request. The type has no field that can
/// carry message text, so nothing content-bearing crosses the capture seam.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShapeMetadata {
    pub backend: String,
    pub model: String,
    pub num_messages: usize,
    pub messages_shape: Vec<MessageShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ShapeMetadata {
    pub fn for_messages(backend: &str, model: &str, messages: &[ChatMessage]) -> Self {
        Self {
            backend: backend.to_string(),
            model: model.to_string(),
            num_messages: messages.len(),
            messages_shape: messages
                .iter()
                .map(|m| MessageShape {
                    role: m.role,
                    length: m.content.len(),
                })
                .collect(),
            ..Default::default()
        }
    }
}

/// The metrics/telemetry collaborator. Receives event names and shape
/// metadata only.
pub trait EventCapture: Send + Sync {
    fn capture(&self, event: &str, shape: &ShapeMetadata);
}

/// Default capture: one structured log line per event.
#[derive(Debug, Default)]
pub struct TracingCapture;

impl EventCapture for TracingCapture {
    fn capture(&self, event: &str, shape: &ShapeMetadata) {
        tracing::info!(
            event,
            backend = %shape.backend,
            model = %shape.model,
            num_messages = shape.num_messages,
            response_length = shape.response_length,
            duration_ms = shape.duration_ms,
            "llm event"
        );
    }
}

/// Keeps every captured event in memory, in order.
#[derive(Debug, Default)]
pub struct MemoryCapture {
    events: Mutex<Vec<(String, ShapeMetadata)>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, ShapeMetadata)> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.events().into_iter().map(|(name, _)| name).collect()
    }
}

impl EventCapture for MemoryCapture {
    fn capture(&self, event: &str, shape: &ShapeMetadata) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((event.to_string(), shape.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_has_lengths_not_content() {
        let messages = vec![
            ChatMessage::system("secret instructions"),
            ChatMessage::user("my private code"),
        ];
        let shape = ShapeMetadata::for_messages("ollama", "llama3", &messages);
        let json = serde_json::to_string(&shape).unwrap();

        assert_eq!(shape.num_messages, 2);
        assert_eq!(shape.messages_shape[1].length, "my private code".len());
        assert!(!json.contains("secret instructions"));
        assert!(!json.contains("my private code"));
    }

    #[test]
    fn event_names_are_scoped_by_feature() {
        assert_eq!(event_name("Ctrl+K", SENDING_MESSAGE), "Ctrl+K - Sending Message");
    }

    #[test]
    fn memory_capture_preserves_order() {
        let capture = MemoryCapture::new();
        capture.capture("a", &ShapeMetadata::default());
        capture.capture("b", &ShapeMetadata::default());
        assert_eq!(capture.names(), vec!["a", "b"]);
    }
}
