use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ChatError, ErrorKind, LlmuxError};
use crate::providers::models::ModelInfo;
use crate::transport::host::TransportHost;
use crate::transport::wire::{Command, HostFrame, ModelListEvent, Reply, read_frame, write_frame};
use crate::types::{ChatRequest, ProviderSettings, RequestId, StreamEvent};

enum Connection {
    /// Host and bus live in this process.
    Local(Arc<TransportHost>),
    /// Commands are written to a byte stream by a writer task.
    Stream(mpsc::UnboundedSender<Command>),
}

type Waiters<T> = Mutex<HashMap<RequestId, oneshot::Sender<T>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    connection: Connection,
    /// Local filter table: only ids in here are delivered.
    filters: Mutex<HashMap<RequestId, mpsc::UnboundedSender<StreamEvent>>>,
    replies: Waiters<Reply>,
    models: Waiters<ModelListEvent>,
}

impl Inner {
    /// Deliver one bus event to its filter entry, if this client owns it.
    fn route_event(&self, event: StreamEvent) {
        let mut filters = lock(&self.filters);
        let id = event.request_id().clone();
        if event.is_terminal() {
            if let Some(tx) = filters.remove(&id) {
                let _ = tx.send(event);
            }
            return;
        }
        let delivered = match filters.get(&id) {
            Some(tx) => tx.send(event).is_ok(),
            None => return,
        };
        if !delivered {
            // Handle dropped while the entry was still registered.
            filters.remove(&id);
        }
    }

    fn route_models(&self, event: ModelListEvent) {
        if let Some(tx) = lock(&self.models).remove(event.request_id()) {
            let _ = tx.send(event);
        }
    }

    fn route_reply(&self, reply: Reply) {
        match lock(&self.replies).remove(reply.request_id()) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(request_id = %reply.request_id(), "unsolicited reply"),
        }
    }

    /// The bus dropped events this client never saw. End every open request
    /// with an error and abort it instead of leaving it short of deltas or
    /// waiting on a terminal event that was lost.
    fn fail_lagged(&self, skipped: u64) {
        let open: Vec<_> = lock(&self.filters).drain().collect();
        if open.is_empty() {
            return;
        }
        tracing::warn!(skipped, requests = open.len(), "client lagged behind the event bus");
        let error = LlmuxError::Lagged { skipped }.to_chat_error();
        for (request_id, tx) in open {
            let _ = tx.send(StreamEvent::Error {
                request_id: request_id.clone(),
                error: error.clone(),
            });
            self.send_only(Command::Abort { request_id });
        }
    }

    fn fail_lagged_listings(&self, skipped: u64) {
        let waiting: Vec<_> = lock(&self.models).drain().collect();
        tracing::warn!(skipped, listings = waiting.len(), "client lagged behind the model bus");
        let error = LlmuxError::Lagged { skipped }.to_chat_error();
        for (request_id, tx) in waiting {
            let _ = tx.send(ModelListEvent::ModelListError {
                request_id,
                error: error.clone(),
            });
        }
    }

    fn release(&self, id: &RequestId) {
        lock(&self.filters).remove(id);
    }

    /// Drop every pending waiter and filter so callers see end-of-stream.
    fn disconnect(&self) {
        lock(&self.filters).clear();
        lock(&self.replies).clear();
        lock(&self.models).clear();
    }

    fn send_only(&self, command: Command) {
        match &self.connection {
            Connection::Local(host) => {
                host.call(command);
            }
            Connection::Stream(commands) => {
                if commands.send(command).is_err() {
                    tracing::debug!("connection closed, command not sent");
                }
            }
        }
    }

    async fn call(&self, command: Command) -> Result<Reply, LlmuxError> {
        match &self.connection {
            Connection::Local(host) => Ok(host.call(command)),
            Connection::Stream(commands) => {
                let (tx, rx) = oneshot::channel();
                let id = command.request_id().clone();
                lock(&self.replies).insert(id.clone(), tx);
                if commands.send(command).is_err() {
                    lock(&self.replies).remove(&id);
                    return Err(closed());
                }
                rx.await.map_err(|_| closed())
            }
        }
    }
}

fn closed() -> LlmuxError {
    LlmuxError::Protocol("connection closed".to_string())
}

/// Caller side of the transport.
///
/// Assigns request ids, installs a filter entry before sending `Start`, and
/// hands out a [`RequestHandle`] per request. A single dispatch loop reads
/// the shared bus and discards events for ids it has no entry for. If that
/// loop falls behind the bus, every open request ends with a `transport
/// lagged` error.
pub struct TransportClient {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportClient {
    /// In-process client. Must be created inside a tokio runtime.
    pub fn local(host: Arc<TransportHost>) -> Self {
        let mut events = host.subscribe();
        let mut listings = host.subscribe_models();
        let inner = Arc::new(Inner {
            connection: Connection::Local(host),
            filters: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
        });

        let dispatch = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => dispatch.route_event(event),
                        Err(RecvError::Lagged(skipped)) => dispatch.fail_lagged(skipped),
                        Err(RecvError::Closed) => break,
                    },
                    listing = listings.recv() => match listing {
                        Ok(listing) => dispatch.route_models(listing),
                        Err(RecvError::Lagged(skipped)) => dispatch.fail_lagged_listings(skipped),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            dispatch.disconnect();
        });

        Self {
            inner,
            tasks: vec![task],
        }
    }

    /// Client over a byte stream served by [`TransportHost::serve`].
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, mut outgoing) = mpsc::unbounded_channel::<Command>();
        let inner = Arc::new(Inner {
            connection: Connection::Stream(commands),
            filters: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
        });

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(command) = outgoing.recv().await {
                if let Err(e) = write_frame(&mut writer, &command).await {
                    tracing::warn!("transport write failed: {e}");
                    break;
                }
            }
        });

        let dispatch = Arc::clone(&inner);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("transport read failed: {e}");
                        break;
                    }
                };
                match read_frame::<HostFrame>(&line) {
                    Ok(Some(HostFrame::Reply(reply))) => dispatch.route_reply(reply),
                    Ok(Some(HostFrame::Event { event, .. })) => dispatch.route_event(event),
                    Ok(Some(HostFrame::Models(listing))) => dispatch.route_models(listing),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("ignoring frame: {e}"),
                }
            }
            dispatch.disconnect();
        });

        Self {
            inner,
            tasks: vec![writer_task, reader_task],
        }
    }

    /// Start a chat request. Rejections (unknown backend, duplicate id) are
    /// returned here; everything else arrives through the handle.
    pub async fn start(&self, request: ChatRequest) -> Result<RequestHandle, LlmuxError> {
        let id = RequestId::generate();
        let backend = request.backend.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.filters).insert(id.clone(), tx);

        let reply = self
            .inner
            .call(Command::Start {
                request_id: id.clone(),
                request,
            })
            .await;
        match reply {
            Ok(Reply::Started { .. }) => Ok(RequestHandle {
                id,
                events: rx,
                inner: Arc::clone(&self.inner),
                done: false,
            }),
            Ok(Reply::Rejected { error, .. }) => {
                self.inner.release(&id);
                Err(rejection(&backend, &id, error))
            }
            Ok(other) => {
                self.inner.release(&id);
                Err(LlmuxError::Protocol(format!("unexpected reply to start: {other:?}")))
            }
            Err(e) => {
                self.inner.release(&id);
                Err(e)
            }
        }
    }

    /// Abort by id. Releases the local filter entry; no event follows.
    pub fn abort(&self, id: &RequestId) {
        self.inner.release(id);
        self.inner.send_only(Command::Abort {
            request_id: id.clone(),
        });
    }

    /// List the models a local or self-hosted backend serves.
    pub async fn list_models(
        &self,
        backend: &str,
        settings: ProviderSettings,
    ) -> Result<Vec<ModelInfo>, LlmuxError> {
        let id = RequestId::generate();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.models).insert(id.clone(), tx);

        let reply = self
            .inner
            .call(Command::ListModels {
                request_id: id.clone(),
                backend: backend.to_string(),
                settings,
            })
            .await;
        match reply {
            Ok(Reply::Accepted { .. }) => {}
            Ok(Reply::Rejected { error, .. }) => {
                lock(&self.inner.models).remove(&id);
                return Err(rejection(backend, &id, error));
            }
            Ok(other) => {
                lock(&self.inner.models).remove(&id);
                return Err(LlmuxError::Protocol(format!(
                    "unexpected reply to list_models: {other:?}"
                )));
            }
            Err(e) => {
                lock(&self.inner.models).remove(&id);
                return Err(e);
            }
        }

        match rx.await.map_err(|_| closed())? {
            ModelListEvent::ModelList { models, .. } => Ok(models),
            ModelListEvent::ModelListError { error, .. } => Err(LlmuxError::Remote(error)),
        }
    }

    /// Number of requests this client is still listening to.
    pub fn open_filters(&self) -> usize {
        lock(&self.inner.filters).len()
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.inner.disconnect();
    }
}

fn rejection(backend: &str, id: &RequestId, error: ChatError) -> LlmuxError {
    match error.kind {
        ErrorKind::UnknownBackend => LlmuxError::UnknownBackend {
            name: backend.to_string(),
        },
        ErrorKind::DuplicateRequest => LlmuxError::DuplicateRequest(id.to_string()),
        _ => LlmuxError::Remote(error),
    }
}

/// Events of one request, in emission order, ending after its terminal
/// event. Dropping the handle releases the filter entry but does not abort.
pub struct RequestHandle {
    id: RequestId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    inner: Arc<Inner>,
    done: bool,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Next event; `None` after the terminal event, an abort, or disconnect.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let event = self.events.recv().await;
        match &event {
            Some(e) if !e.is_terminal() => {}
            _ => self.done = true,
        }
        event
    }

    /// Drain the stream and return the final text, or the error event.
    pub async fn final_text(mut self) -> Result<String, LlmuxError> {
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::TextDelta { .. } => {}
                StreamEvent::FinalMessage { full_text, .. } => return Ok(full_text),
                StreamEvent::Error { error, .. } => return Err(LlmuxError::Remote(error)),
            }
        }
        Err(LlmuxError::Protocol(format!(
            "request {} ended without a terminal event",
            self.id
        )))
    }

    /// Abort this request. Subsequent `next` calls return `None`.
    pub fn abort(&mut self) {
        self.done = true;
        self.events.close();
        self.inner.release(&self.id);
        self.inner.send_only(Command::Abort {
            request_id: self.id.clone(),
        });
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.done {
            self.inner.release(&self.id);
        }
    }
}
