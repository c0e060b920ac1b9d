pub mod abort;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod providers;
pub mod transport;
pub mod types;

pub use error::{ChatError, ErrorKind, LlmuxError};
pub use lifecycle::LifecycleController;
pub use types::{BackendName, ChatMessage, ChatRequest, ProviderSettings, RequestId, StreamEvent};
