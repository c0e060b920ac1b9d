use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ChatError, LlmuxError};
use crate::providers::models::ModelInfo;
use crate::types::{Channel, ChatRequest, ProviderSettings, RequestId, StreamEvent};

/// Caller-to-host messages. Plain data only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Start {
        request_id: RequestId,
        request: ChatRequest,
    },
    Abort {
        request_id: RequestId,
    },
    ListModels {
        request_id: RequestId,
        backend: String,
        #[serde(default)]
        settings: ProviderSettings,
    },
}

impl Command {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Start { request_id, .. } => request_id,
            Self::Abort { request_id } => request_id,
            Self::ListModels { request_id, .. } => request_id,
        }
    }
}

/// Immediate answer to a [`Command`]. Failures of an accepted request arrive
/// later as events, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Started { request_id: RequestId },
    Rejected { request_id: RequestId, error: ChatError },
    Aborted { request_id: RequestId },
    /// A model listing was queued; the result comes on the `on_models` bus.
    Accepted { request_id: RequestId },
}

impl Reply {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Started { request_id } => request_id,
            Self::Rejected { request_id, .. } => request_id,
            Self::Aborted { request_id } => request_id,
            Self::Accepted { request_id } => request_id,
        }
    }
}

/// Published on the `on_models` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelListEvent {
    ModelList {
        request_id: RequestId,
        models: Vec<ModelInfo>,
    },
    ModelListError {
        request_id: RequestId,
        error: ChatError,
    },
}

impl ModelListEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::ModelList { request_id, .. } => request_id,
            Self::ModelListError { request_id, .. } => request_id,
        }
    }
}

/// One newline-delimited frame written by a host over a byte stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum HostFrame {
    Reply(Reply),
    Event { channel: Channel, event: StreamEvent },
    Models(ModelListEvent),
}

impl HostFrame {
    pub fn event(event: StreamEvent) -> Self {
        Self::Event {
            channel: event.channel(),
            event,
        }
    }
}

/// Serialize `value` as one JSON line and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), LlmuxError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line =
        serde_json::to_vec(value).map_err(|e| LlmuxError::Protocol(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Parse one frame line. Blank lines yield `None`.
pub fn read_frame<T>(line: &str) -> Result<Option<T>, LlmuxError>
where
    T: for<'de> Deserialize<'de>,
{
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| LlmuxError::Protocol(format!("malformed frame: {e}")))
}
