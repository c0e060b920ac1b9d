use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed caller-facing text for every authentication failure, whatever the
/// backend's own status representation was.
pub const INVALID_CREDENTIAL_MESSAGE: &str = "Invalid API key.";

#[derive(Debug, Error)]
pub enum LlmuxError {
    #[error("unknown backend: {name}")]
    UnknownBackend { name: String },

    #[error("request id already in flight: {0}")]
    DuplicateRequest(String),

    #[error("auth failed for {backend}: {message}")]
    InvalidCredential { backend: String, message: String },

    #[error("{backend} is not configured: {message}")]
    Configuration { backend: String, message: String },

    #[error("upstream error from {backend}: {message}")]
    BackendFailure {
        backend: String,
        message: String,
        status: Option<u16>,
    },

    #[error("adapter fault in {backend}: {message}")]
    AdapterFault { backend: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    /// A bus subscriber fell behind and lost events it cannot replay.
    #[error("transport lagged: {skipped} events dropped")]
    Lagged { skipped: u64 },

    /// An error reported by the other side of a transport connection.
    #[error("{}", .0.description)]
    Remote(ChatError),
}

/// Coarse error category carried across the transport boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownBackend,
    DuplicateRequest,
    InvalidCredential,
    Configuration,
    BackendFailure,
}

/// Serializable projection of an error: what an `Error` event or a rejected
/// command carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatError {
    pub kind: ErrorKind,
    pub description: String,
}

impl ChatError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }
}

impl LlmuxError {
    /// Backend named by the error, when it carries one.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::InvalidCredential { backend, .. } => Some(backend),
            Self::Configuration { backend, .. } => Some(backend),
            Self::BackendFailure { backend, .. } => Some(backend),
            Self::AdapterFault { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// Adapter faults are reported exactly like backend failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownBackend { .. } => ErrorKind::UnknownBackend,
            Self::DuplicateRequest(_) => ErrorKind::DuplicateRequest,
            Self::InvalidCredential { .. } => ErrorKind::InvalidCredential,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Remote(e) => e.kind,
            _ => ErrorKind::BackendFailure,
        }
    }

    /// Caller-facing description.
    pub fn description(&self) -> String {
        match self {
            Self::UnknownBackend { name } => {
                format!("Error: provider \"{name}\" is not recognized.")
            }
            Self::DuplicateRequest(id) => format!("request id {id} is already in flight"),
            Self::InvalidCredential { .. } => INVALID_CREDENTIAL_MESSAGE.to_string(),
            Self::Configuration { message, .. } => message.clone(),
            Self::BackendFailure {
                backend, message, ..
            } => format!("{backend}: {message}"),
            Self::AdapterFault { backend, message } => format!("{backend}: {message}"),
            Self::Io(e) => format!("io error: {e}"),
            Self::Protocol(msg) => format!("transport protocol error: {msg}"),
            Self::Config(msg) => format!("config error: {msg}"),
            Self::Lagged { skipped } => format!("transport lagged: {skipped} events dropped"),
            Self::Remote(e) => e.description.clone(),
        }
    }

    pub fn to_chat_error(&self) -> ChatError {
        ChatError::new(self.kind(), self.description())
    }
}

impl From<&LlmuxError> for ChatError {
    fn from(e: &LlmuxError) -> Self {
        e.to_chat_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_share_one_description() {
        let a = LlmuxError::InvalidCredential {
            backend: "anthropic".to_string(),
            message: "401 Unauthorized".to_string(),
        };
        let b = LlmuxError::InvalidCredential {
            backend: "gemini".to_string(),
            message: "API_KEY_INVALID".to_string(),
        };
        assert_eq!(a.description(), INVALID_CREDENTIAL_MESSAGE);
        assert_eq!(a.description(), b.description());
        assert_eq!(a.kind(), ErrorKind::InvalidCredential);
    }

    #[test]
    fn adapter_fault_looks_like_backend_failure() {
        let fault = LlmuxError::AdapterFault {
            backend: "openAI".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(fault.kind(), ErrorKind::BackendFailure);
        assert_eq!(fault.description(), "openAI: boom");
    }

    #[test]
    fn backend_failure_keeps_context() {
        let err = LlmuxError::BackendFailure {
            backend: "groq".to_string(),
            message: "429 Too Many Requests: slow down".to_string(),
            status: Some(429),
        };
        let chat = err.to_chat_error();
        assert_eq!(chat.kind, ErrorKind::BackendFailure);
        assert!(chat.description.contains("groq"));
        assert!(chat.description.contains("slow down"));
    }

    #[test]
    fn chat_error_serializes_snake_case_kind() {
        let chat = ChatError::new(ErrorKind::InvalidCredential, "Invalid API key.");
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["kind"], "invalid_credential");
        assert_eq!(json["description"], "Invalid API key.");
    }

    #[test]
    fn lagged_is_a_backend_failure() {
        let chat = LlmuxError::Lagged { skipped: 7 }.to_chat_error();
        assert_eq!(chat.kind, ErrorKind::BackendFailure);
        assert_eq!(chat.description, "transport lagged: 7 events dropped");
    }
}
