//! Message-channel transport: one channel message carries one JSON-RPC message.
//!
//! Client mode dials through a [`ChannelConnector`] and re-dials with
//! exponential backoff after an unexpected close. Server mode wraps a channel
//! that was already accepted and never reconnects.
use crate::lsp::config::ReconnectPolicy;
use crate::lsp::error::TransportError;
use crate::lsp::listeners::Subscription;
use crate::lsp::transport::{CloseEvent, ReconnectEvent, Transport, TransportEvents};
use crate::lsp::types::Message;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

pub type ChannelSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type ChannelStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Both directions of an established channel.
pub struct ChannelHalves {
    pub sink: ChannelSink,
    pub stream: ChannelStream,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<ChannelHalves, TransportError>;

    fn label(&self) -> &str {
        "channel"
    }
}

/// Dials a WebSocket URL; text frames carry the JSON-RPC messages.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketConnector { url: url.into() }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self) -> Result<ChannelHalves, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.url, e)))?;
        Ok(websocket_halves(ws))
    }

    fn label(&self) -> &str {
        "ws"
    }
}

pub fn websocket_halves<S>(ws: WebSocketStream<S>) -> ChannelHalves
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let sink = sink
        .sink_map_err(|e: tokio_tungstenite::tungstenite::Error| TransportError::Send(e.to_string()))
        .with(|text: String| futures::future::ready(Ok::<_, TransportError>(WsMessage::Text(text))));
    let stream = stream.filter_map(|item| {
        futures::future::ready(match item {
            Ok(WsMessage::Text(text)) => Some(Ok(text)),
            Ok(WsMessage::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
            // ping/pong/close frames are handled by tungstenite itself
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::Io(e.to_string()))),
        })
    });
    ChannelHalves {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}

/// Two connected in-process channel endpoints.
pub fn memory_channel_pair() -> (ChannelHalves, ChannelHalves) {
    let (a_tx, a_rx) = futures::channel::mpsc::unbounded::<String>();
    let (b_tx, b_rx) = futures::channel::mpsc::unbounded::<String>();
    (memory_halves(a_tx, b_rx), memory_halves(b_tx, a_rx))
}

fn memory_halves(
    tx: futures::channel::mpsc::UnboundedSender<String>,
    rx: futures::channel::mpsc::UnboundedReceiver<String>,
) -> ChannelHalves {
    ChannelHalves {
        sink: Box::pin(tx.sink_map_err(|e| TransportError::Send(e.to_string()))),
        stream: Box::pin(rx.map(Ok)),
    }
}

enum Mode {
    Client {
        connector: Arc<dyn ChannelConnector>,
        policy: ReconnectPolicy,
    },
    Server {
        halves: Mutex<Option<ChannelHalves>>,
    },
}

struct ChannelInner {
    label: String,
    mode: Mode,
    events: TransportEvents,
    sink: tokio::sync::Mutex<Option<ChannelSink>>,
    connected: AtomicBool,
    closed: AtomicBool,
    generation: AtomicU64,
    attempts: AtomicU32,
    scheduled: AtomicU32,
    shutdown: CancellationToken,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

pub struct ChannelTransport {
    inner: Arc<ChannelInner>,
}

impl ChannelTransport {
    fn build(label: String, mode: Mode) -> Self {
        ChannelTransport {
            inner: Arc::new(ChannelInner {
                label,
                mode,
                events: TransportEvents::new(),
                sink: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                attempts: AtomicU32::new(0),
                scheduled: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
                reader_task: Mutex::new(None),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Client mode: `open()` dials through `connector`.
    pub fn client(connector: Arc<dyn ChannelConnector>, policy: ReconnectPolicy) -> Self {
        let label = connector.label().to_string();
        Self::build(label, Mode::Client { connector, policy })
    }

    pub fn websocket(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self::client(Arc::new(WebSocketConnector::new(url)), policy)
    }

    /// Server mode: wrap an already-accepted channel.
    pub fn server(halves: ChannelHalves) -> Self {
        Self::server_with_label(halves, "channel")
    }

    fn server_with_label(halves: ChannelHalves, label: &str) -> Self {
        Self::build(
            label.to_string(),
            Mode::Server {
                halves: Mutex::new(Some(halves)),
            },
        )
    }

    pub fn from_websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::server_with_label(websocket_halves(ws), "ws")
    }

    /// Two server-mode transports wired to each other.
    pub fn memory_pair() -> (Self, Self) {
        let (a, b) = memory_channel_pair();
        (
            Self::server_with_label(a, "memory"),
            Self::server_with_label(b, "memory"),
        )
    }

    /// Number of reconnect attempts scheduled over the transport's lifetime.
    pub fn scheduled_reconnects(&self) -> u32 {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    /// Consecutive failed attempts since the last successful (re)connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.inner
            .reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl ChannelInner {
    async fn install(self: &Arc<Self>, halves: ChannelHalves) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.sink.lock().await = Some(halves.sink);
        self.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(Arc::clone(self).read_loop(halves.stream, generation));
        if let Some(previous) = self.reader_task.lock().replace(handle) {
            previous.abort();
        }
    }

    // Boxed so the read -> reconnect -> install -> read spawn chain has a nameable type.
    fn read_loop(self: Arc<Self>, mut stream: ChannelStream, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let reason = loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    item = stream.next() => match item {
                        Some(Ok(text)) => self.events.deliver_payload(&self.label, text.as_bytes()),
                        Some(Err(e)) => {
                            tracing::warn!(transport = %self.label, error = %e, "channel read failed");
                            self.events.errors.emit(&e);
                            break e.to_string();
                        }
                        None => break "channel closed by remote".to_string(),
                    }
                }
            };
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            self.on_unexpected_close(reason).await;
        })
    }

    async fn on_unexpected_close(self: &Arc<Self>, reason: String) {
        self.connected.store(false, Ordering::SeqCst);
        self.sink.lock().await.take();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let will_reconnect = matches!(&self.mode, Mode::Client { policy, .. } if policy.enabled);
        tracing::info!(transport = %self.label, reason = %reason, will_reconnect, "channel disconnected");
        self.events.closes.emit(&CloseEvent {
            reason,
            intentional: false,
            will_reconnect,
        });
        if will_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(Arc::clone(self).reconnect_loop()));
    }

    fn reconnect_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Mode::Client { connector, policy } = &self.mode else {
                return;
            };
            loop {
                let attempt = self.attempts.load(Ordering::SeqCst) + 1;
                if attempt > policy.max_attempts {
                    tracing::warn!(transport = %self.label, attempts = attempt - 1, "giving up reconnecting");
                    self.events.reconnects.emit(&ReconnectEvent::GaveUp {
                        attempts: attempt - 1,
                    });
                    return;
                }
                self.attempts.store(attempt, Ordering::SeqCst);
                let delay = policy.delay_for(attempt);
                self.scheduled.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    transport = %self.label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.events.reconnects.emit(&ReconnectEvent::Scheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });

                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match connector.connect().await {
                    Ok(halves) => {
                        if self.closed.load(Ordering::SeqCst) {
                            return;
                        }
                        self.attempts.store(0, Ordering::SeqCst);
                        // Free the slot before the new reader starts so a drop
                        // of the fresh connection can schedule its own retry.
                        self.reconnect_task.lock().take();
                        self.install(halves).await;
                        tracing::info!(transport = %self.label, attempt, "reconnected");
                        self.events
                            .reconnects
                            .emit(&ReconnectEvent::Reconnected { attempt });
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(transport = %self.label, attempt, error = %e, "reconnect attempt failed");
                        self.events.errors.emit(&e);
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let halves = match &inner.mode {
            Mode::Client { connector, .. } => connector.connect().await?,
            Mode::Server { halves } => halves.lock().take().ok_or(TransportError::Closed)?,
        };
        inner.install(halves).await;
        tracing::debug!(transport = %inner.label, "channel transport opened");
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = message
            .to_json()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = sink.send(text).await {
            tracing::error!(transport = %self.inner.label, error = %e, "channel send failed");
            self.inner.events.errors.emit(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.shutdown.cancel();
        let had_pending_reconnect = match inner.reconnect_task.lock().take() {
            Some(task) => {
                let pending = !task.is_finished();
                task.abort();
                pending
            }
            None => false,
        };
        if let Some(mut sink) = inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(task) = inner.reader_task.lock().take() {
            task.abort();
        }
        let was_connected = inner.connected.swap(false, Ordering::SeqCst);
        if was_connected || had_pending_reconnect {
            inner.events.closes.emit(&CloseEvent {
                reason: "closed by local peer".to_string(),
                intentional: true,
                will_reconnect: false,
            });
        }
        tracing::debug!(transport = %inner.label, "channel transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn label(&self) -> &str {
        &self.inner.label
    }

    fn on_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Subscription {
        self.inner.events.messages.subscribe(handler)
    }

    fn on_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Subscription {
        self.inner.events.errors.subscribe(handler)
    }

    fn on_close(&self, handler: Box<dyn Fn(&CloseEvent) + Send + Sync>) -> Subscription {
        self.inner.events.closes.subscribe(handler)
    }

    fn on_reconnect(&self, handler: Box<dyn Fn(&ReconnectEvent) + Send + Sync>) -> Subscription {
        self.inner.events.reconnects.subscribe(handler)
    }
}
