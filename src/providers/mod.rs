pub mod anthropic;
pub mod common;
pub mod gemini;
pub mod models;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use crate::abort::AbortHandle;
use crate::error::LlmuxError;
use crate::types::{BackendName, ChatMessage, ProviderSettings, Role};

/// What an adapter is asked to send. Built by the lifecycle controller with
/// message contents already trimmed; adapters only borrow it.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub backend: BackendName,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub settings: ProviderSettings,
}

impl ChatCall {
    /// All system message contents joined by newlines, if any are non-empty.
    pub fn system_prompt(&self) -> Option<String> {
        let joined = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        (!joined.is_empty()).then_some(joined)
    }

    /// Conversation turns without system messages, in order.
    pub fn turns(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }
}

/// Receiver of one request's normalized output.
///
/// Adapters call these from whatever task drives the backend stream. The
/// implementation decides whether an event still counts; adapters never
/// track terminal state themselves.
pub trait ChatSink: Send + Sync {
    /// `full_text` is the concatenation of every `new_text` so far.
    fn on_text(&self, new_text: &str, full_text: &str);
    fn on_final_message(&self, full_text: &str);
    fn on_error(&self, error: LlmuxError);
    fn register_abort_handle(&self, handle: AbortHandle);
}

pub type SinkRef = Arc<dyn ChatSink>;

/// One backend family's translation between the uniform contract and its
/// native streaming protocol.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start the backend call and return without waiting on the network.
    ///
    /// Missing settings are reported through `sink.on_error`, not as `Err`.
    /// An `Err` here is treated as an adapter fault by the caller.
    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError>;
}
