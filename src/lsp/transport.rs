//! Transport abstraction: moves whole JSON-RPC messages between peers.
use crate::lsp::error::TransportError;
use crate::lsp::listeners::{Listeners, Subscription};
use crate::lsp::types::Message;
use async_trait::async_trait;

/// Why a transport stopped carrying messages.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseEvent {
    pub reason: String,
    /// `true` when the local side called `close()`.
    pub intentional: bool,
    /// `true` when a reconnect attempt has been scheduled.
    pub will_reconnect: bool,
}

/// Emitted by transports that can re-establish their connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectEvent {
    Scheduled { attempt: u32, delay_ms: u64 },
    Reconnected { attempt: u32 },
    GaveUp { attempts: u32 },
}

/// Contract shared by all transports.
///
/// Inbound messages are delivered to `on_message` subscribers in receipt order.
/// Listeners should be attached before `open()`; messages that arrive while no
/// listener is attached are not replayed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start delivering inbound traffic (and, for client-mode transports,
    /// establish the connection).
    async fn open(&self) -> Result<(), TransportError>;

    /// Fails fast with `TransportError::NotConnected` when disconnected.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Close intentionally. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Short label for logs and middleware context (`stdio`, `ws`, `memory`, ...).
    fn label(&self) -> &str;

    fn on_message(&self, handler: Box<dyn Fn(&Message) + Send + Sync>) -> Subscription;

    fn on_error(&self, handler: Box<dyn Fn(&TransportError) + Send + Sync>) -> Subscription;

    fn on_close(&self, handler: Box<dyn Fn(&CloseEvent) + Send + Sync>) -> Subscription;

    fn on_reconnect(&self, _handler: Box<dyn Fn(&ReconnectEvent) + Send + Sync>) -> Subscription {
        Subscription::detached()
    }
}

/// Listener lists every transport implementation carries.
#[derive(Clone)]
pub struct TransportEvents {
    pub messages: Listeners<Message>,
    pub errors: Listeners<TransportError>,
    pub closes: Listeners<CloseEvent>,
    pub reconnects: Listeners<ReconnectEvent>,
}

impl Default for TransportEvents {
    fn default() -> Self {
        TransportEvents {
            messages: Listeners::new("transport.message"),
            errors: Listeners::new("transport.error"),
            closes: Listeners::new("transport.close"),
            reconnects: Listeners::new("transport.reconnect"),
        }
    }
}

impl TransportEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one inbound payload and fan it out; parse failures become error
    /// events and never tear the transport down.
    pub fn deliver_payload(&self, label: &str, payload: &[u8]) {
        match crate::lsp::message_parser::parse_message_from_slice(payload) {
            Ok(message) => {
                tracing::trace!(transport = label, kind = %message.kind(), "inbound message");
                self.messages.emit(&message);
            }
            Err(e) => {
                tracing::warn!(transport = label, error = %e, "dropping unparsable inbound payload");
                self.errors.emit(&e);
            }
        }
    }
}
