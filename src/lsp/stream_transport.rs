// byte-stream transport: Content-Length framing over any AsyncRead/AsyncWrite pair
use crate::lsp::error::TransportError;
use crate::lsp::framed::ContentLengthCodec;
use crate::lsp::listeners::Subscription;
use crate::lsp::transport::{CloseEvent, Transport, TransportEvents};
use crate::lsp::types::Message;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct StreamState {
    connected: AtomicBool,
    closing: AtomicBool,
    close_emitted: AtomicBool,
}

impl StreamState {
    fn emit_close_once(&self, events: &TransportEvents, reason: String) {
        if self.close_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        events.closes.emit(&CloseEvent {
            reason,
            intentional: self.closing.load(Ordering::SeqCst),
            will_reconnect: false,
        });
    }
}

pub struct StreamTransport {
    label: String,
    events: TransportEvents,
    state: Arc<StreamState>,
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxedWriter, ContentLengthCodec>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>, // Keep child process handle if spawned
}

impl StreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_label("stream", Box::new(reader), Box::new(writer))
    }

    fn with_label(label: &str, reader: BoxedReader, writer: BoxedWriter) -> Self {
        StreamTransport {
            label: label.to_string(),
            events: TransportEvents::new(),
            state: Arc::new(StreamState {
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                close_emitted: AtomicBool::new(false),
            }),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(
                writer,
                ContentLengthCodec::new(),
            ))),
            reader_task: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    /// Speak over this process's own stdin/stdout (server side of a stdio pipe).
    pub fn stdio() -> Self {
        Self::with_label(
            "stdio",
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        )
    }

    /// Spawn `exe` and speak over its stdin/stdout. Stderr is inherited.
    pub fn spawn(exe: &str, args: &[String]) -> Result<Self, TransportError> {
        let mut cmd = Command::new(exe);
        for a in args {
            cmd.arg(a);
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connect(format!("failed to spawn '{}': {}", exe, e)))?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("failed to take child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("failed to take child stdout".to_string()))?;

        let transport = Self::with_label("process", Box::new(stdout), Box::new(writer));
        *transport.child.lock() = Some(child);
        Ok(transport)
    }
}

async fn read_loop(
    reader: BoxedReader,
    label: String,
    events: TransportEvents,
    state: Arc<StreamState>,
) {
    let mut frames = FramedRead::new(reader, ContentLengthCodec::new());
    let reason = loop {
        match frames.next().await {
            Some(Ok(Ok(body))) => events.deliver_payload(&label, &body),
            Some(Ok(Err(e))) => {
                tracing::warn!(transport = %label, error = %e, "framing error");
                events.errors.emit(&e);
            }
            Some(Err(e)) => {
                let e = TransportError::from(e);
                tracing::error!(transport = %label, error = %e, "read failed");
                events.errors.emit(&e);
                break e.to_string();
            }
            None => break "end of stream".to_string(),
        }
    };
    tracing::debug!(transport = %label, reason = %reason, "reader stopped");
    state.emit_close_once(&events, reason);
}

#[async_trait]
impl Transport for StreamTransport {
    async fn open(&self) -> Result<(), TransportError> {
        if self.state.closing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let Some(reader) = self.reader.lock().take() else {
            // already open
            return Ok(());
        };
        self.state.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(read_loop(
            reader,
            self.label.clone(),
            self.events.clone(),
            Arc::clone(&self.state),
        ));
        *self.reader_task.lock() = Some(handle);
        tracing::debug!(transport = %self.label, "stream transport opened");
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = message
            .to_json()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        if let Err(e) = writer.send(text).await {
            let e = TransportError::from(e);
            tracing::error!(transport = %self.label, error = %e, "write failed");
            self.events.errors.emit(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.state.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.get_mut().shutdown().await;
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        self.reader.lock().take();
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
        self.state
            .emit_close_once(&self.events, "closed by local peer".to_string());
        tracing::debug!(transport = %self.label, "stream transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn on_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Subscription {
        self.events.messages.subscribe(handler)
    }

    fn on_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Subscription {
        self.events.errors.subscribe(handler)
    }

    fn on_close(&self, handler: Box<dyn Fn(&CloseEvent) + Send + Sync>) -> Subscription {
        self.events.closes.subscribe(handler)
    }
}
