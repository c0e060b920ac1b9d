use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::abort::{AbortHandle, AbortRegistry};
use crate::error::LlmuxError;
use crate::metrics::{self, EventCapture, ShapeMetadata, TracingCapture};
use crate::providers::anthropic::AnthropicAdapter;
use crate::providers::gemini::GeminiAdapter;
use crate::providers::ollama::OllamaAdapter;
use crate::providers::openai::OpenAiAdapter;
use crate::providers::{ChatCall, ChatSink, ProviderAdapter, SinkRef};
use crate::types::{
    BackendName, ChatMessage, ChatRequest, LifecycleState, RequestId, StreamEvent,
};

/// Receives every event the controller lets through, already tagged with
/// its request id. Called with the request's state lock held, so it must not
/// block or call back into the controller for the same id.
pub type EventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// One adapter per backend family.
#[derive(Clone)]
pub struct Adapters {
    pub chat_completions: Arc<dyn ProviderAdapter>,
    pub anthropic: Arc<dyn ProviderAdapter>,
    pub gemini: Arc<dyn ProviderAdapter>,
    pub ollama: Arc<dyn ProviderAdapter>,
}

impl Adapters {
    /// The real HTTP adapters, sharing one connection pool.
    pub fn http() -> Self {
        let client = crate::providers::common::http_client();
        Self {
            chat_completions: Arc::new(OpenAiAdapter::with_client(client.clone())),
            anthropic: Arc::new(AnthropicAdapter::with_client(client.clone())),
            gemini: Arc::new(GeminiAdapter::with_client(client.clone())),
            ollama: Arc::new(OllamaAdapter::with_client(client)),
        }
    }

    /// The only place a backend name selects behavior.
    pub fn for_backend(&self, backend: BackendName) -> &Arc<dyn ProviderAdapter> {
        match backend {
            BackendName::OpenAi
            | BackendName::OpenRouter
            | BackendName::DeepSeek
            | BackendName::Groq
            | BackendName::OpenAiCompatible => &self.chat_completions,
            BackendName::Anthropic => &self.anthropic,
            BackendName::Gemini => &self.gemini,
            BackendName::Ollama => &self.ollama,
        }
    }
}

struct RecordState {
    lifecycle: LifecycleState,
    /// Length of `fullTextSoFar`, for the abort metric.
    text_len: usize,
}

struct RequestRecord {
    id: RequestId,
    feature: String,
    shape: ShapeMetadata,
    submitted: Instant,
    handler: EventHandler,
    state: Mutex<RecordState>,
}

impl RequestRecord {
    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.submitted.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

struct Inner {
    adapters: Adapters,
    registry: AbortRegistry,
    requests: Mutex<HashMap<RequestId, Arc<RequestRecord>>>,
    capture: Arc<dyn EventCapture>,
}

impl Inner {
    fn requests(&self) -> MutexGuard<'_, HashMap<RequestId, Arc<RequestRecord>>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capture(&self, record: &RequestRecord, event: &str, shape: &ShapeMetadata) {
        self.capture
            .capture(&metrics::event_name(&record.feature, event), shape);
    }

    /// Bookkeeping shared by every terminal transition.
    fn release(&self, id: &RequestId) {
        self.registry.remove(id);
        self.requests().remove(id);
    }
}

/// Owns every request's state machine:
/// `Pending -> Streaming -> {Finalized | Errored | Aborted}`.
///
/// Terminal states are sticky. Whatever an adapter emits after one is
/// dropped here, so callers see at most one terminal event per id and
/// nothing after an abort.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::with_adapters(Adapters::http(), Arc::new(TracingCapture))
    }

    pub fn with_adapters(adapters: Adapters, capture: Arc<dyn EventCapture>) -> Self {
        Self {
            inner: Arc::new(Inner {
                adapters,
                registry: AbortRegistry::new(),
                requests: Mutex::new(HashMap::new()),
                capture,
            }),
        }
    }

    /// Validate, assign an id, and dispatch. Returns before any network I/O.
    ///
    /// An unknown backend is rejected here, before any state exists.
    pub fn submit(
        &self,
        request: ChatRequest,
        handler: EventHandler,
    ) -> Result<RequestId, LlmuxError> {
        self.submit_with_id(RequestId::generate(), request, handler)
    }

    /// [`submit`](Self::submit) with an id chosen by the caller, so that the
    /// caller's event filter can exist before the first event is published.
    pub fn submit_with_id(
        &self,
        id: RequestId,
        request: ChatRequest,
        handler: EventHandler,
    ) -> Result<RequestId, LlmuxError> {
        let backend: BackendName = request.backend.parse()?;

        let messages: Vec<ChatMessage> = request
            .messages
            .into_iter()
            .map(|m| ChatMessage::new(m.role, m.content.trim()))
            .collect();

        let shape = ShapeMetadata::for_messages(backend.as_str(), &request.model, &messages);
        let record = Arc::new(RequestRecord {
            id: id.clone(),
            feature: request.feature,
            shape,
            submitted: Instant::now(),
            handler,
            state: Mutex::new(RecordState {
                lifecycle: LifecycleState::Pending,
                text_len: 0,
            }),
        });

        {
            let mut requests = self.inner.requests();
            if requests.contains_key(&id) {
                return Err(LlmuxError::DuplicateRequest(id.to_string()));
            }
            requests.insert(id.clone(), Arc::clone(&record));
        }

        let sending = ShapeMetadata {
            last_message_length: messages.last().map(|m| m.content.len()),
            ..record.shape.clone()
        };
        self.inner
            .capture(&record, metrics::SENDING_MESSAGE, &sending);
        tracing::info!(request_id = %id, backend = %backend, model = %request.model, "dispatching request");

        let call = ChatCall {
            backend,
            model: request.model,
            messages,
            settings: request.settings,
        };
        self.dispatch(record, call);
        Ok(id)
    }

    fn dispatch(&self, record: Arc<RequestRecord>, call: ChatCall) {
        let backend = call.backend;
        let sink: SinkRef = Arc::new(RequestSink {
            record: Arc::clone(&record),
            inner: Arc::clone(&self.inner),
        });

        {
            let mut state = record.lock();
            if state.lifecycle != LifecycleState::Pending {
                return;
            }
            state.lifecycle = LifecycleState::Streaming;
        }

        if call.messages.is_empty() {
            sink.on_error(LlmuxError::Configuration {
                backend: backend.to_string(),
                message: "No messages to send.".to_string(),
            });
            return;
        }

        let adapter = self.inner.adapters.for_backend(backend);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            adapter.send_chat(&call, Arc::clone(&sink))
        }));
        let fault = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.description(),
            Err(panic) => panic_message(panic.as_ref()),
        };
        tracing::error!(request_id = %record.id, adapter = adapter.name(), "adapter fault: {fault}");
        sink.on_error(LlmuxError::AdapterFault {
            backend: backend.to_string(),
            message: fault,
        });
    }

    /// Stop a request. Idempotent; a no-op for unknown or finished ids.
    ///
    /// No event is delivered for an aborted request.
    pub fn abort(&self, id: &RequestId) {
        let record = self.inner.requests().remove(id);
        let Some(record) = record else {
            self.inner.registry.remove(id);
            return;
        };

        let text_len = {
            let mut state = record.lock();
            if state.lifecycle.is_terminal() {
                return;
            }
            state.lifecycle = LifecycleState::Aborted;
            state.text_len
        };

        tracing::info!(request_id = %id, "request aborted");
        let shape = ShapeMetadata {
            response_length: Some(text_len),
            duration_ms: Some(record.elapsed_ms()),
            ..record.shape.clone()
        };
        self.inner.capture(&record, metrics::ABORT, &shape);
        self.inner.registry.invoke(id);
    }

    /// State of a live request; `None` once it has terminated or was never
    /// submitted.
    pub fn state(&self, id: &RequestId) -> Option<LifecycleState> {
        let record = self.inner.requests().get(id).cloned();
        record.map(|r| r.lock().lifecycle)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.requests().len()
    }

    pub fn has_abort_handle(&self, id: &RequestId) -> bool {
        self.inner.registry.contains(id)
    }

    pub fn registered_abort_handles(&self) -> usize {
        self.inner.registry.len()
    }
}

/// Abort-aware, one-shot wrapper around a request's handler; this is what
/// the adapter talks to.
struct RequestSink {
    record: Arc<RequestRecord>,
    inner: Arc<Inner>,
}

impl RequestSink {
    fn dropped(&self, what: &str, state: LifecycleState) {
        tracing::debug!(request_id = %self.record.id, ?state, "dropping late {what}");
    }
}

impl ChatSink for RequestSink {
    fn on_text(&self, new_text: &str, full_text: &str) {
        let mut state = self.record.lock();
        if state.lifecycle.is_terminal() {
            self.dropped("text delta", state.lifecycle);
            return;
        }
        state.lifecycle = LifecycleState::Streaming;
        state.text_len = full_text.len();
        (self.record.handler)(StreamEvent::TextDelta {
            request_id: self.record.id.clone(),
            new_text: new_text.to_string(),
            full_text: full_text.to_string(),
        });
    }

    fn on_final_message(&self, full_text: &str) {
        {
            let mut state = self.record.lock();
            if state.lifecycle.is_terminal() {
                self.dropped("final message", state.lifecycle);
                return;
            }
            state.lifecycle = LifecycleState::Finalized;
            (self.record.handler)(StreamEvent::FinalMessage {
                request_id: self.record.id.clone(),
                full_text: full_text.to_string(),
            });
        }

        self.inner.release(&self.record.id);
        tracing::info!(request_id = %self.record.id, "request finalized");
        let shape = ShapeMetadata {
            response_length: Some(full_text.len()),
            duration_ms: Some(self.record.elapsed_ms()),
            ..self.record.shape.clone()
        };
        self.inner
            .capture(&self.record, metrics::RECEIVED_FULL_MESSAGE, &shape);
    }

    fn on_error(&self, error: LlmuxError) {
        {
            let mut state = self.record.lock();
            if state.lifecycle.is_terminal() {
                self.dropped("error", state.lifecycle);
                return;
            }
            state.lifecycle = LifecycleState::Errored;
            (self.record.handler)(StreamEvent::Error {
                request_id: self.record.id.clone(),
                error: error.to_chat_error(),
            });
        }

        self.inner.release(&self.record.id);
        tracing::warn!(request_id = %self.record.id, "request failed: {error}");
        let shape = ShapeMetadata {
            duration_ms: Some(self.record.elapsed_ms()),
            error_kind: Some(error.kind()),
            ..self.record.shape.clone()
        };
        self.inner.capture(&self.record, metrics::ERROR, &shape);
    }

    fn register_abort_handle(&self, handle: AbortHandle) {
        let state = self.record.lock();
        match state.lifecycle {
            LifecycleState::Aborted => {
                drop(state);
                // Aborted before the call began: cancel it right away.
                handle.invoke();
            }
            LifecycleState::Finalized | LifecycleState::Errored => {}
            LifecycleState::Pending | LifecycleState::Streaming => {
                self.inner
                    .registry
                    .register(self.record.id.clone(), handle);
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("adapter panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("adapter panicked: {s}")
    } else {
        "adapter panicked".to_string()
    }
}
