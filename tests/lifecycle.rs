//! Lifecycle controller state machine, driven by fake adapters whose sinks
//! the test pushes events into by hand.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llmux::abort::AbortHandle;
use llmux::error::{ErrorKind, LlmuxError};
use llmux::lifecycle::{Adapters, EventHandler, LifecycleController};
use llmux::metrics::MemoryCapture;
use llmux::providers::common::spawn_stream;
use llmux::providers::{ChatCall, ProviderAdapter, SinkRef};
use llmux::types::{
    BackendName, ChatMessage, ChatRequest, LifecycleState, RequestId, StreamEvent,
};
use tokio_test::{assert_err, assert_ok};

/// Records each call and hands its sink back to the test.
#[derive(Default)]
struct ManualAdapter {
    calls: Mutex<Vec<(ChatCall, SinkRef)>>,
    aborts: Arc<AtomicUsize>,
    register_on_send: bool,
}

impl ManualAdapter {
    fn registering() -> Arc<Self> {
        Arc::new(Self {
            register_on_send: true,
            ..Default::default()
        })
    }

    fn deferred() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn abort_handle(&self) -> AbortHandle {
        let aborts = Arc::clone(&self.aborts);
        AbortHandle::new(move || {
            aborts.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn last(&self) -> (ChatCall, SinkRef) {
        self.calls.lock().unwrap().last().cloned().expect("adapter was not called")
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl ProviderAdapter for ManualAdapter {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError> {
        if self.register_on_send {
            sink.register_abort_handle(self.abort_handle());
        }
        self.calls.lock().unwrap().push((call.clone(), sink));
        Ok(())
    }
}

struct FailingAdapter;

impl ProviderAdapter for FailingAdapter {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn send_chat(&self, _call: &ChatCall, _sink: SinkRef) -> Result<(), LlmuxError> {
        Err(LlmuxError::Protocol("could not build request".to_string()))
    }
}

struct PanickingAdapter;

impl ProviderAdapter for PanickingAdapter {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn send_chat(&self, _call: &ChatCall, _sink: SinkRef) -> Result<(), LlmuxError> {
        panic!("adapter bug");
    }
}

/// Panics inside its spawned stream task, after the call has started.
struct PanickingStreamAdapter;

impl ProviderAdapter for PanickingStreamAdapter {
    fn name(&self) -> &'static str {
        "panicking-stream"
    }

    fn send_chat(&self, call: &ChatCall, sink: SinkRef) -> Result<(), LlmuxError> {
        spawn_stream(call.backend, sink, async {
            tokio::task::yield_now().await;
            decode_chunk()
        });
        Ok(())
    }
}

fn decode_chunk() -> Result<String, LlmuxError> {
    panic!("bad chunk")
}

fn adapters(all: Arc<dyn ProviderAdapter>) -> Adapters {
    Adapters {
        chat_completions: all.clone(),
        anthropic: all.clone(),
        gemini: all.clone(),
        ollama: all,
    }
}

struct Harness {
    controller: LifecycleController,
    capture: Arc<MemoryCapture>,
    events: Arc<Mutex<Vec<StreamEvent>>>,
    handler: EventHandler,
}

impl Harness {
    fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        let capture = Arc::new(MemoryCapture::new());
        let controller = LifecycleController::with_adapters(adapters(adapter), capture.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler: EventHandler = Arc::new(move |event| sink.lock().unwrap().push(event));
        Self {
            controller,
            capture,
            events,
            handler,
        }
    }

    fn submit(&self, request: ChatRequest) -> Result<RequestId, LlmuxError> {
        self.controller.submit(request, self.handler.clone())
    }

    fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }
}

fn hello(backend: &str) -> ChatRequest {
    ChatRequest::new(backend, "m", vec![ChatMessage::user("hi ")])
}

#[test]
fn trims_input_and_reports_deltas_in_order() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let id = assert_ok!(h.submit(hello("ollama")));
    let (call, sink) = adapter.last();
    assert_eq!(call.messages[0].content, "hi");
    assert_eq!(call.backend, BackendName::Ollama);
    assert_eq!(h.controller.state(&id), Some(LifecycleState::Streaming));
    assert!(h.controller.has_abort_handle(&id));

    sink.on_text("H", "H");
    sink.on_text("ello", "Hello");
    sink.on_text("!", "Hello!");
    sink.on_final_message("Hello!");

    let expected = vec![
        StreamEvent::TextDelta {
            request_id: id.clone(),
            new_text: "H".to_string(),
            full_text: "H".to_string(),
        },
        StreamEvent::TextDelta {
            request_id: id.clone(),
            new_text: "ello".to_string(),
            full_text: "Hello".to_string(),
        },
        StreamEvent::TextDelta {
            request_id: id.clone(),
            new_text: "!".to_string(),
            full_text: "Hello!".to_string(),
        },
        StreamEvent::FinalMessage {
            request_id: id.clone(),
            full_text: "Hello!".to_string(),
        },
    ];
    assert_eq!(h.events(), expected);
    assert_eq!(h.controller.state(&id), None);
    assert_eq!(h.controller.registered_abort_handles(), 0);
    assert_eq!(adapter.abort_count(), 0);
}

#[test]
fn abort_before_first_event_yields_nothing() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let id = h.submit(hello("openAI")).unwrap();
    let (_, sink) = adapter.last();
    h.controller.abort(&id);

    // The backend keeps talking; none of it may surface.
    sink.on_text("H", "H");
    sink.on_final_message("H");
    sink.on_error(LlmuxError::Protocol("late".to_string()));

    assert!(h.events().is_empty());
    assert_eq!(adapter.abort_count(), 1);
    assert_eq!(h.controller.registered_abort_handles(), 0);
    assert_eq!(h.controller.in_flight(), 0);
    assert_eq!(h.capture.names(), vec!["Chat - Sending Message", "Chat - Abort"]);
}

#[test]
fn abort_after_some_text_stops_further_events() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let id = h.submit(hello("anthropic")).unwrap();
    let (_, sink) = adapter.last();
    sink.on_text("par", "par");
    h.controller.abort(&id);
    sink.on_text("tial", "partial");
    sink.on_final_message("partial");

    assert_eq!(h.events().len(), 1);
    let (_, shape) = h.capture.events().pop().unwrap();
    assert_eq!(shape.response_length, Some("par".len()));
}

#[test]
fn terminal_state_is_sticky() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let id = h.submit(hello("gemini")).unwrap();
    let (_, sink) = adapter.last();
    sink.on_text("a", "a");
    sink.on_final_message("a");
    sink.on_text("b", "ab");
    sink.on_error(LlmuxError::Protocol("after the fact".to_string()));
    sink.on_final_message("ab");

    let events = h.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(matches!(events[1], StreamEvent::FinalMessage { .. }));

    // Aborting a finished request is a no-op and never runs the handle.
    h.controller.abort(&id);
    assert_eq!(adapter.abort_count(), 0);
    assert_eq!(h.events().len(), 2);
}

#[test]
fn error_is_terminal_and_sanitized() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let id = h.submit(hello("groq")).unwrap();
    let (_, sink) = adapter.last();
    sink.on_error(LlmuxError::InvalidCredential {
        backend: "groq".to_string(),
        message: "401 Unauthorized".to_string(),
    });
    sink.on_text("x", "x");

    match h.events().as_slice() {
        [StreamEvent::Error { request_id, error }] => {
            assert_eq!(request_id, &id);
            assert_eq!(error.kind, ErrorKind::InvalidCredential);
            assert_eq!(error.description, "Invalid API key.");
        }
        other => panic!("expected one error event, got {other:?}"),
    }
    assert_eq!(h.controller.registered_abort_handles(), 0);
    let (_, shape) = h.capture.events().pop().unwrap();
    assert_eq!(shape.error_kind, Some(ErrorKind::InvalidCredential));
}

#[test]
fn double_abort_runs_handle_once() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let id = h.submit(hello("deepseek")).unwrap();
    h.controller.abort(&id);
    h.controller.abort(&id);
    h.controller.abort(&RequestId::from("never-submitted"));

    assert_eq!(adapter.abort_count(), 1);
    assert_eq!(
        h.capture.names().iter().filter(|n| n.ends_with("Abort")).count(),
        1
    );
}

#[test]
fn handle_registered_after_abort_fires_immediately() {
    let adapter = ManualAdapter::deferred();
    let h = Harness::new(adapter.clone());

    let id = h.submit(hello("openRouter")).unwrap();
    let (_, sink) = adapter.last();
    h.controller.abort(&id);
    assert_eq!(adapter.abort_count(), 0);

    sink.register_abort_handle(adapter.abort_handle());

    assert_eq!(adapter.abort_count(), 1);
    assert_eq!(h.controller.registered_abort_handles(), 0);
}

#[test]
fn unknown_backend_creates_no_state() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let err = assert_err!(h.submit(hello("mistral")));
    assert!(matches!(&err, LlmuxError::UnknownBackend { name } if name == "mistral"));
    assert_eq!(err.description(), "Error: provider \"mistral\" is not recognized.");

    assert_eq!(adapter.call_count(), 0);
    assert_eq!(h.controller.in_flight(), 0);
    assert_eq!(h.controller.registered_abort_handles(), 0);
    assert!(h.capture.names().is_empty());
    assert!(h.events().is_empty());
}

#[test]
fn duplicate_live_id_is_rejected() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());
    let id = RequestId::from("fixed");

    h.controller
        .submit_with_id(id.clone(), hello("ollama"), h.handler.clone())
        .unwrap();
    let err = h
        .controller
        .submit_with_id(id.clone(), hello("ollama"), h.handler.clone())
        .unwrap_err();
    assert!(matches!(err, LlmuxError::DuplicateRequest(_)));
    assert_eq!(adapter.call_count(), 1);

    // Once finished, the id is free again.
    adapter.last().1.on_final_message("");
    assert_ok!(h.controller.submit_with_id(id, hello("ollama"), h.handler.clone()));
}

#[test]
fn adapter_err_becomes_error_event() {
    let h = Harness::new(Arc::new(FailingAdapter));

    let id = h.submit(hello("openAICompatible")).unwrap();

    match h.events().as_slice() {
        [StreamEvent::Error { request_id, error }] => {
            assert_eq!(request_id, &id);
            assert_eq!(error.kind, ErrorKind::BackendFailure);
            assert!(error.description.contains("could not build request"));
        }
        other => panic!("expected one error event, got {other:?}"),
    }
    assert_eq!(h.controller.in_flight(), 0);
}

#[test]
fn adapter_panic_becomes_error_event() {
    let h = Harness::new(Arc::new(PanickingAdapter));

    h.submit(hello("anthropic")).unwrap();

    match h.events().as_slice() {
        [StreamEvent::Error { error, .. }] => {
            assert_eq!(error.kind, ErrorKind::BackendFailure);
            assert!(error.description.contains("adapter bug"));
        }
        other => panic!("expected one error event, got {other:?}"),
    }
    assert_eq!(h.controller.registered_abort_handles(), 0);
}

#[tokio::test]
async fn stream_task_panic_becomes_error_event() {
    let h = Harness::new(Arc::new(PanickingStreamAdapter));

    h.submit(hello("gemini")).unwrap();

    for _ in 0..100 {
        if !h.events().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    match h.events().as_slice() {
        [StreamEvent::Error { error, .. }] => {
            assert_eq!(error.kind, ErrorKind::BackendFailure);
            assert!(error.description.contains("stream task panicked"));
        }
        other => panic!("expected one error event, got {other:?}"),
    }
    assert_eq!(h.controller.registered_abort_handles(), 0);
}

#[test]
fn empty_conversation_is_configuration_error() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    h.submit(ChatRequest::new("ollama", "m", Vec::new())).unwrap();

    assert_eq!(adapter.call_count(), 0);
    match h.events().as_slice() {
        [StreamEvent::Error { error, .. }] => assert_eq!(error.kind, ErrorKind::Configuration),
        other => panic!("expected one error event, got {other:?}"),
    }
}

#[test]
fn concurrent_requests_are_independent() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let a = h.submit(hello("ollama")).unwrap();
    let (_, sink_a) = adapter.last();
    let b = h.submit(hello("ollama")).unwrap();
    let (_, sink_b) = adapter.last();
    assert_ne!(a, b);

    sink_a.on_text("a1", "a1");
    sink_b.on_text("b1", "b1");
    h.controller.abort(&a);
    sink_a.on_text("a2", "a1a2");
    sink_b.on_final_message("b1");

    let events = h.events();
    let for_a: Vec<_> = events.iter().filter(|e| e.request_id() == &a).collect();
    let for_b: Vec<_> = events.iter().filter(|e| e.request_id() == &b).collect();
    assert_eq!(for_a.len(), 1);
    assert_eq!(for_b.len(), 2);
    assert!(for_b[1].is_terminal());
    assert_eq!(adapter.abort_count(), 1);
}

#[test]
fn metrics_carry_shape_but_never_content() {
    let adapter = ManualAdapter::registering();
    let h = Harness::new(adapter.clone());

    let request = ChatRequest::new(
        "openAI",
        "gpt-4o",
        vec![
            ChatMessage::system("TOP SECRET SYSTEM PROMPT"),
            ChatMessage::user("my confidential question"),
        ],
    )
    .with_feature("Ctrl+K");
    h.submit(request).unwrap();
    let (_, sink) = adapter.last();
    sink.on_text("private answer", "private answer");
    sink.on_final_message("private answer");

    let captured = h.capture.events();
    assert_eq!(
        h.capture.names(),
        vec!["Ctrl+K - Sending Message", "Ctrl+K - Received Full Message"]
    );
    let sending = &captured[0].1;
    assert_eq!(sending.num_messages, 2);
    assert_eq!(sending.last_message_length, Some("my confidential question".len()));
    let received = &captured[1].1;
    assert_eq!(received.response_length, Some("private answer".len()));
    assert!(received.duration_ms.is_some());

    let serialized = serde_json::to_string(&captured.iter().map(|(_, s)| s).collect::<Vec<_>>())
        .unwrap();
    for secret in ["TOP SECRET", "confidential", "private answer"] {
        assert!(!serialized.contains(secret), "{secret} leaked into metrics");
    }
}
