use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::Client;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

use crate::config::{Config, SettingsOfProvider};
use crate::error::LlmuxError;
use crate::lifecycle::{EventHandler, LifecycleController};
use crate::providers::common::http_client;
use crate::providers::models::list_models;
use crate::transport::wire::{Command, HostFrame, ModelListEvent, Reply, read_frame, write_frame};
use crate::types::{BackendName, Channel, RequestId, StreamEvent};

/// Callee side of the transport.
///
/// Every event of every request goes onto one ordered bus; `on_text`,
/// `on_final_message` and `on_error` are views over it. Per-id order is
/// therefore preserved across channels. Callers filter by id.
pub struct TransportHost {
    controller: LifecycleController,
    events: broadcast::Sender<StreamEvent>,
    models: broadcast::Sender<ModelListEvent>,
    bus_capacity: usize,
    defaults: SettingsOfProvider,
    client: Client,
}

impl TransportHost {
    pub fn new(config: &Config) -> Self {
        Self::with_controller(LifecycleController::new(), config)
    }

    pub fn with_controller(controller: LifecycleController, config: &Config) -> Self {
        let capacity = config.transport.bus_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (models, _) = broadcast::channel(capacity);
        Self {
            controller,
            events,
            models,
            bus_capacity: capacity,
            defaults: config.providers.clone(),
            client: http_client(),
        }
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    /// Handle one command and answer it immediately.
    ///
    /// Must be called from within a tokio runtime: adapters and model
    /// listings spawn their work onto it.
    pub fn call(&self, command: Command) -> Reply {
        match command {
            Command::Start {
                request_id,
                mut request,
            } => {
                let backend = match request.backend.parse::<BackendName>() {
                    Ok(backend) => backend,
                    Err(e) => return rejected(request_id, &e),
                };
                request.settings = request.settings.merged_over(self.defaults.get(backend));

                let bus = self.events.clone();
                let handler: EventHandler = Arc::new(move |event| {
                    // No subscribers is not an error; the event is just unobserved.
                    let _ = bus.send(event);
                });
                match self
                    .controller
                    .submit_with_id(request_id.clone(), request, handler)
                {
                    Ok(request_id) => Reply::Started { request_id },
                    Err(e) => rejected(request_id, &e),
                }
            }
            Command::Abort { request_id } => {
                self.controller.abort(&request_id);
                Reply::Aborted { request_id }
            }
            Command::ListModels {
                request_id,
                backend,
                settings,
            } => {
                let backend = match backend.parse::<BackendName>() {
                    Ok(backend) => backend,
                    Err(e) => return rejected(request_id, &e),
                };
                let settings = settings.merged_over(self.defaults.get(backend));
                let client = self.client.clone();
                let bus = self.models.clone();
                let id = request_id.clone();
                tokio::spawn(async move {
                    let event = match list_models(&client, backend, &settings).await {
                        Ok(models) => ModelListEvent::ModelList {
                            request_id: id,
                            models,
                        },
                        Err(e) => {
                            tracing::warn!(request_id = %id, "model listing failed: {e}");
                            ModelListEvent::ModelListError {
                                request_id: id,
                                error: e.to_chat_error(),
                            }
                        }
                    };
                    let _ = bus.send(event);
                });
                Reply::Accepted { request_id }
            }
        }
    }

    /// All three chat channels, in emission order.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.events.subscribe(),
            channel: None,
        }
    }

    /// A single named channel.
    pub fn subscribe_channel(&self, channel: Channel) -> EventSubscription {
        EventSubscription {
            rx: self.events.subscribe(),
            channel: Some(channel),
        }
    }

    pub fn subscribe_models(&self) -> ModelSubscription {
        ModelSubscription {
            rx: self.models.subscribe(),
        }
    }

    /// Run the host over a byte stream of newline-delimited JSON.
    ///
    /// Commands are read from `reader`; replies, events and model lists are
    /// written to `writer` as [`HostFrame`]s. When the reader reaches EOF,
    /// every request started over this connection and still live is aborted.
    ///
    /// If the writer falls behind the bus, each request it was carrying is
    /// aborted and ended with a `transport lagged` error frame.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, writer: W) -> Result<(), LlmuxError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // Subscribe before reading the first command so no event is missed.
        let mut events = self.events.subscribe();
        let mut models = self.models.subscribe();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();
        let requests = Arc::new(Mutex::new(ConnectionRequests::default()));

        let host = Arc::clone(&self);
        let tracked = Arc::clone(&requests);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            loop {
                let frames = tokio::select! {
                    biased;
                    reply = reply_rx.recv() => match reply {
                        Some(reply) => vec![HostFrame::Reply(reply)],
                        None => break,
                    },
                    event = events.recv() => match event {
                        Ok(event) => {
                            if !lock(&tracked).forward_event(&event) {
                                continue;
                            }
                            vec![HostFrame::event(event)]
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            host.fail_lagged_chats(&tracked, skipped)
                        }
                        Err(RecvError::Closed) => break,
                    },
                    listing = models.recv() => match listing {
                        Ok(listing) => {
                            if !lock(&tracked).forward_listing(&listing) {
                                continue;
                            }
                            vec![HostFrame::Models(listing)]
                        }
                        Err(RecvError::Lagged(skipped)) => fail_lagged_listings(&tracked, skipped),
                        Err(RecvError::Closed) => break,
                    },
                };
                for frame in &frames {
                    if let Err(e) = write_frame(&mut writer, frame).await {
                        tracing::warn!("transport write failed, closing connection: {e}");
                        return;
                    }
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        let result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(LlmuxError::from(e)),
            };
            let command = match read_frame::<Command>(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("ignoring command: {e}");
                    continue;
                }
            };
            // Tracked before the call: a synchronous adapter may emit its
            // terminal event before `call` returns.
            let added = lock(&requests).begin(&command);
            let reply = self.call(command);
            lock(&requests).settle(added, &reply);
            if reply_tx.send(reply).is_err() {
                break Ok(());
            }
        };

        let live: Vec<RequestId> = lock(&requests).chats.drain().collect();
        if !live.is_empty() {
            tracing::info!(count = live.len(), "connection closed, aborting its requests");
        }
        for id in &live {
            self.controller.abort(id);
        }
        drop(reply_tx);
        if let Err(e) = writer_task.await {
            tracing::warn!("transport writer task failed: {e}");
        }
        result
    }

    /// Abort every chat a lagging connection was carrying and build the
    /// error frames that end them.
    fn fail_lagged_chats(
        &self,
        requests: &Mutex<ConnectionRequests>,
        skipped: u64,
    ) -> Vec<HostFrame> {
        let failed = lock(requests).fail_chats(self.bus_capacity);
        tracing::warn!(skipped, requests = failed.len(), "connection lagged behind the event bus");
        let error = LlmuxError::Lagged { skipped }.to_chat_error();
        failed
            .into_iter()
            .map(|request_id| {
                self.controller.abort(&request_id);
                HostFrame::event(StreamEvent::Error {
                    request_id,
                    error: error.clone(),
                })
            })
            .collect()
    }
}

fn fail_lagged_listings(requests: &Mutex<ConnectionRequests>, skipped: u64) -> Vec<HostFrame> {
    let failed = lock(requests).fail_listings();
    tracing::warn!(skipped, listings = failed.len(), "connection lagged behind the model bus");
    let error = LlmuxError::Lagged { skipped }.to_chat_error();
    failed
        .into_iter()
        .map(|request_id| {
            HostFrame::Models(ModelListEvent::ModelListError {
                request_id,
                error: error.clone(),
            })
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A command id newly tracked by [`ConnectionRequests::begin`].
#[derive(Debug, PartialEq, Eq)]
enum Tracked {
    Chat(RequestId),
    Listing(RequestId),
}

/// Requests one `serve` connection is answerable for, shared by its reader
/// and writer halves. Ids leave as soon as their terminal frame is written.
#[derive(Debug, Default)]
struct ConnectionRequests {
    chats: HashSet<RequestId>,
    listings: HashSet<RequestId>,
    /// Chats failed after a lag; their leftover bus events are swallowed.
    failed_chats: HashSet<RequestId>,
    /// Bus events still buffered from before the lag. `failed_chats` is
    /// forgotten once they have been read.
    residual: usize,
    failed_listings: HashSet<RequestId>,
}

impl ConnectionRequests {
    fn begin(&mut self, command: &Command) -> Option<Tracked> {
        match command {
            Command::Start { request_id, .. } => self
                .chats
                .insert(request_id.clone())
                .then(|| Tracked::Chat(request_id.clone())),
            Command::ListModels { request_id, .. } => self
                .listings
                .insert(request_id.clone())
                .then(|| Tracked::Listing(request_id.clone())),
            Command::Abort { .. } => None,
        }
    }

    fn settle(&mut self, added: Option<Tracked>, reply: &Reply) {
        match (added, reply) {
            (Some(Tracked::Chat(id)), Reply::Rejected { .. }) => {
                self.chats.remove(&id);
            }
            (Some(Tracked::Listing(id)), Reply::Rejected { .. }) => {
                self.listings.remove(&id);
            }
            (_, Reply::Aborted { request_id }) => {
                self.chats.remove(request_id);
            }
            _ => {}
        }
    }

    /// Whether to write `event`. A terminal event retires its id.
    fn forward_event(&mut self, event: &StreamEvent) -> bool {
        let id = event.request_id();
        let swallow = self.failed_chats.contains(id);
        if self.residual > 0 {
            self.residual -= 1;
            if self.residual == 0 {
                self.failed_chats.clear();
            }
        }
        if event.is_terminal() {
            self.chats.remove(id);
            self.failed_chats.remove(id);
        }
        !swallow
    }

    fn forward_listing(&mut self, listing: &ModelListEvent) -> bool {
        let id = listing.request_id();
        self.listings.remove(id);
        !self.failed_listings.remove(id)
    }

    /// Give up on every live chat after the bus overran this connection.
    fn fail_chats(&mut self, bus_capacity: usize) -> Vec<RequestId> {
        let failed: Vec<RequestId> = self.chats.drain().collect();
        self.failed_chats.extend(failed.iter().cloned());
        self.residual = bus_capacity;
        failed
    }

    fn fail_listings(&mut self) -> Vec<RequestId> {
        let failed: Vec<RequestId> = self.listings.drain().collect();
        self.failed_listings.extend(failed.iter().cloned());
        failed
    }
}

fn rejected(request_id: RequestId, error: &LlmuxError) -> Reply {
    tracing::warn!(request_id = %request_id, "rejecting command: {error}");
    Reply::Rejected {
        request_id,
        error: error.to_chat_error(),
    }
}

/// A subscription to the chat event bus, optionally narrowed to one channel.
pub struct EventSubscription {
    rx: broadcast::Receiver<StreamEvent>,
    channel: Option<Channel>,
}

impl EventSubscription {
    /// Next event on this subscription.
    ///
    /// `Lagged` means events were lost and the subscriber must treat every
    /// request it follows as broken; `Closed` means the host is gone.
    pub async fn recv(&mut self) -> Result<StreamEvent, RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if self.channel.is_none_or(|c| c == event.channel()) {
                return Ok(event);
            }
        }
    }
}

pub struct ModelSubscription {
    rx: broadcast::Receiver<ModelListEvent>,
}

impl ModelSubscription {
    pub async fn recv(&mut self) -> Result<ModelListEvent, RecvError> {
        self.rx.recv().await
    }
}
