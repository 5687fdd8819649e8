//! Runtime shared by client and server: outbound calls, the inbound dispatch
//! loop, cancellation and dynamic registration.
use crate::lsp::capability::{CapabilityGuard, CapabilitySide, CapabilityTree, GuardRole};
use crate::lsp::config::{PeerConfig, PeerInfo};
use crate::lsp::correlator::Correlator;
use crate::lsp::error::{CorrelationError, ProtocolError, RpcError, TransportError};
use crate::lsp::handler::{
    HandlerRegistry, NotificationHandler, ParamsValidator, RequestContext, RequestHandler,
};
use crate::lsp::health::{ConnectionState, HealthTracker, PingFn};
use crate::lsp::lifecycle::{Lifecycle, PeerState, Transition};
use crate::lsp::listeners::{Listeners, Subscription};
use crate::lsp::message_creator::{self as mc, methods};
use crate::lsp::middleware::{
    Direction, Middleware, MiddlewareContext, MiddlewareTerminal, Outcome, Pipeline,
};
use crate::lsp::partial::{PartialResultCollector, PARTIAL_RESULT_TOKEN_FIELD};
use crate::lsp::registration::RegistrationStore;
use crate::lsp::transport::{CloseEvent, ReconnectEvent, Transport};
use crate::lsp::types::{Message, Notification, Request, RequestId, Response};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use lsp_types::{ProgressToken, Registration};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn local_side(self) -> CapabilitySide {
        match self {
            Role::Client => CapabilitySide::Client,
            Role::Server => CapabilitySide::Server,
        }
    }

    fn remote_side(self) -> CapabilitySide {
        match self {
            Role::Client => CapabilitySide::Server,
            Role::Server => CapabilitySide::Client,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum TimeoutSetting {
    #[default]
    Inherit,
    After(Duration),
    Never,
}

/// Per-call overrides for [`Peer::request_with`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    timeout: TimeoutSetting,
    cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, after: Duration) -> Self {
        self.timeout = TimeoutSetting::After(after);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = TimeoutSetting::Never;
        self
    }

    /// Cancelling the token rejects the call and notifies the remote.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn resolve_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        match self.timeout {
            TimeoutSetting::Inherit => default,
            TimeoutSetting::After(after) => Some(after),
            TimeoutSetting::Never => None,
        }
    }
}

enum PeerEvent {
    Message(Message),
    Closed(CloseEvent),
    Reconnect(ReconnectEvent),
}

/// Handler work produced by one inbound message.
enum Dispatch {
    /// Request handlers, polled concurrently by the dispatch loop.
    Concurrent(BoxFuture<'static, ()>),
    /// Notification handlers, run one at a time in receipt order.
    Ordered(BoxFuture<'static, ()>),
}

struct Session {
    transport: Arc<dyn Transport>,
    subscriptions: Vec<Subscription>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    _task: JoinHandle<()>,
}

pub(crate) struct PeerInner {
    role: Role,
    config: PeerConfig,
    correlator: Correlator,
    partials: PartialResultCollector,
    outbound_guard: ArcSwap<CapabilityGuard>,
    inbound_guard: ArcSwap<CapabilityGuard>,
    remote_registrations: RegistrationStore,
    local_registrations: RegistrationStore,
    handlers: HandlerRegistry,
    pipeline: ArcSwap<Pipeline>,
    validator: RwLock<Option<Arc<dyn ParamsValidator>>>,
    pub(crate) lifecycle: Lifecycle,
    health: HealthTracker,
    remote_info: RwLock<Option<PeerInfo>>,
    inbound_cancels: DashMap<RequestId, CancellationToken>,
    errors: Listeners<RpcError>,
    session: Mutex<Option<Session>>,
}

/// Ends an inbound pass and hands the message back to the dispatch loop.
struct DeliverTerminal;

#[async_trait]
impl MiddlewareTerminal for DeliverTerminal {
    async fn call(&self, _ctx: &mut MiddlewareContext) -> Result<Outcome, RpcError> {
        Ok(Outcome::Forwarded)
    }
}

struct SendTerminal<'a> {
    transport: &'a dyn Transport,
    health: &'a HealthTracker,
}

#[async_trait]
impl MiddlewareTerminal for SendTerminal<'_> {
    async fn call(&self, ctx: &mut MiddlewareContext) -> Result<Outcome, RpcError> {
        self.transport.send(ctx.message.clone()).await?;
        self.health.record_sent();
        Ok(Outcome::Forwarded)
    }
}

/// Rejects the call and tells the remote when an outbound request future is
/// dropped before it settled.
struct CancelOnDrop {
    inner: Arc<PeerInner>,
    id: RequestId,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let cancelled = CorrelationError::Cancelled { id: self.id.clone() };
        if !self.inner.correlator.reject(&self.id, cancelled) {
            return;
        }
        tracing::debug!(id = %self.id, "request future dropped while pending");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let id = self.id.clone();
            handle.spawn(async move { inner.send_cancel_notification(&id).await });
        }
    }
}

/// Closes the partial-result stream once the owning request is done.
struct PartialStream<'a> {
    partials: &'a PartialResultCollector,
    token: ProgressToken,
}

impl Drop for PartialStream<'_> {
    fn drop(&mut self) {
        self.partials.finish(&self.token);
    }
}

impl PeerInner {
    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.session.lock().as_ref().map(|s| Arc::clone(&s.transport))
    }

    fn transport_label(&self) -> String {
        self.transport()
            .map(|t| t.label().to_string())
            .unwrap_or_else(|| "detached".to_string())
    }

    fn build_guard(&self, role: GuardRole, tree: CapabilityTree) -> CapabilityGuard {
        let side = match role {
            GuardRole::Outbound => self.role.remote_side(),
            GuardRole::Inbound => self.role.local_side(),
        };
        CapabilityGuard::new(role, side, tree, self.config.strict_capabilities)
    }

    pub(crate) fn set_remote_capabilities(&self, capabilities: Value) {
        let guard = self.build_guard(GuardRole::Outbound, CapabilityTree::new(capabilities));
        self.outbound_guard.store(Arc::new(guard));
    }

    pub(crate) fn set_remote_info(&self, info: Option<PeerInfo>) {
        *self.remote_info.write() = info;
    }

    /// Drop everything learned from the remote's handshake reply.
    pub(crate) fn forget_remote(&self) {
        let guard = self.build_guard(GuardRole::Outbound, CapabilityTree::default());
        self.outbound_guard.store(Arc::new(guard));
        self.set_remote_info(None);
    }

    pub(crate) fn local_capabilities(&self) -> Value {
        self.inbound_guard.load().tree().as_value().clone()
    }

    pub(crate) fn config(&self) -> &PeerConfig {
        &self.config
    }

    fn validate(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let params = params.unwrap_or(Value::Null);
        let validator = self.validator.read().clone();
        match validator {
            Some(validator) => validator.validate(method, params).map_err(RpcError::InvalidParams),
            None => Ok(params),
        }
    }

    /// Lifecycle gate plus outbound capability check for a local call.
    fn check_outbound(&self, method: &str, is_request: bool) -> Result<(), RpcError> {
        let state = self.lifecycle.state();
        match state {
            PeerState::ShuttingDown | PeerState::Shutdown
                if method != methods::SHUTDOWN && method != methods::EXIT =>
            {
                return Err(ProtocolError::ShutDown {
                    method: method.to_string(),
                }
                .into());
            }
            PeerState::Created | PeerState::Initializing
                if self.role == Role::Client
                    && is_request
                    && method != methods::INITIALIZE =>
            {
                return Err(ProtocolError::NotInitialized {
                    method: method.to_string(),
                }
                .into());
            }
            _ => {}
        }
        self.outbound_guard
            .load()
            .check(method, &self.remote_registrations)?;
        Ok(())
    }

    /// Run a message through the outbound pipeline and, unless an interceptor
    /// settles it, onto the transport.
    async fn send_message(&self, message: Message) -> Result<Outcome, RpcError> {
        let transport = self.transport().ok_or(TransportError::NotConnected)?;
        if !transport.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        let mut ctx = MiddlewareContext::new(Direction::Outbound, message, transport.label());
        let terminal = SendTerminal {
            transport: transport.as_ref(),
            health: &self.health,
        };
        let pipeline = self.pipeline.load_full();
        pipeline.run(&mut ctx, &terminal).await
    }

    async fn send_cancel_notification(&self, id: &RequestId) {
        let notification = Notification::new(methods::CANCEL_REQUEST, Some(mc::cancel_params(id)));
        match self.send_message(notification.into()).await {
            Ok(_) => tracing::debug!(id = %id, "sent $/cancelRequest"),
            Err(e) => tracing::debug!(id = %id, error = %e, "could not send $/cancelRequest"),
        }
    }

    /// Reject a pending outbound request and notify the remote. Only the
    /// first call for an id has any effect.
    async fn cancel_outbound(&self, id: &RequestId) -> bool {
        if !self
            .correlator
            .reject(id, CorrelationError::Cancelled { id: id.clone() })
        {
            return false;
        }
        self.send_cancel_notification(id).await;
        true
    }

    async fn reply(&self, id: RequestId, result: Result<Value, RpcError>) {
        let response = match result {
            Ok(value) => Response::ok(id.clone(), value),
            Err(e) => Response::error(Some(id.clone()), e.to_response_error()),
        };
        match self.send_message(response.into()).await {
            Ok(Outcome::Forwarded) => {}
            Ok(Outcome::Settled(_)) => {
                tracing::debug!(id = %id, "response withheld by middleware")
            }
            Err(e) => tracing::warn!(id = %id, error = %e, "failed to send response"),
        }
    }

    async fn attach(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();
        {
            let mut slot = self.session.lock();
            if slot.is_some() {
                return Err(ProtocolError::InvalidState("a transport is already attached".to_string()).into());
            }

            let mut subscriptions = Vec::with_capacity(4);
            let sender = tx.clone();
            subscriptions.push(transport.on_message(Box::new(move |message: &Message| {
                let _ = sender.send(PeerEvent::Message(message.clone()));
            })));
            let sender = tx.clone();
            subscriptions.push(transport.on_close(Box::new(move |event: &CloseEvent| {
                let _ = sender.send(PeerEvent::Closed(event.clone()));
            })));
            let sender = tx;
            subscriptions.push(transport.on_reconnect(Box::new(move |event: &ReconnectEvent| {
                let _ = sender.send(PeerEvent::Reconnect(event.clone()));
            })));
            let weak: Weak<PeerInner> = Arc::downgrade(self);
            subscriptions.push(transport.on_error(Box::new(move |error: &TransportError| {
                if let Some(inner) = weak.upgrade() {
                    inner.errors.emit(&RpcError::Transport(error.clone()));
                }
            })));

            let task = tokio::spawn(Arc::clone(self).dispatch_loop(rx, shutdown.clone(), finished.clone()));
            *slot = Some(Session {
                transport: Arc::clone(&transport),
                subscriptions,
                shutdown,
                finished,
                _task: task,
            });
        }

        self.health
            .set_state(ConnectionState::Connecting, Some("opening transport"));
        if let Err(e) = transport.open().await {
            tracing::warn!(role = %self.role, transport = transport.label(), error = %e, "transport failed to open");
            self.teardown("transport failed to open").await;
            return Err(e.into());
        }
        self.health
            .set_state(ConnectionState::Connected, Some("transport open"));
        tracing::info!(role = %self.role, transport = transport.label(), "transport attached");

        if let Some(heartbeat) = &self.config.heartbeat {
            self.health.attach_heartbeat(heartbeat, self.ping_fn(heartbeat.ping_method.clone()));
        }
        Ok(())
    }

    fn ping_fn(self: &Arc<Self>, method: Option<String>) -> PingFn {
        let weak = Arc::downgrade(self);
        Arc::new(move || -> BoxFuture<'static, ()> {
            let weak = weak.clone();
            let method = method.clone();
            Box::pin(async move {
                let (Some(inner), Some(method)) = (weak.upgrade(), method) else {
                    return;
                };
                if let Err(e) = inner.send_message(Notification::new(method, None).into()).await {
                    tracing::debug!(error = %e, "heartbeat ping failed");
                }
            })
        })
    }

    /// Detach and close the transport, failing everything still in flight.
    pub(crate) async fn teardown(&self, reason: &str) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };
        self.health
            .set_state(ConnectionState::Disconnecting, Some(reason));
        for subscription in session.subscriptions {
            subscription.unsubscribe();
        }
        if let Err(e) = session.transport.close().await {
            tracing::debug!(error = %e, "transport close failed");
        }
        session.shutdown.cancel();
        self.health.detach_heartbeat();

        let failed = self.correlator.clear(CorrelationError::ConnectionClosed);
        self.partials.clear();
        self.remote_registrations.clear();
        self.local_registrations.clear();
        for entry in self.inbound_cancels.iter() {
            entry.value().cancel();
        }
        self.inbound_cancels.clear();
        self.health
            .set_state(ConnectionState::Disconnected, Some(reason));
        tracing::info!(role = %self.role, reason, failed_requests = failed, "peer detached");
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PeerEvent>,
        shutdown: CancellationToken,
        finished: CancellationToken,
    ) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        let ordered = spawn_ordered_worker(shutdown.clone());
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                event = rx.recv() => match event {
                    Some(PeerEvent::Message(message)) => match self.handle_inbound(message).await {
                        Some(Dispatch::Concurrent(work)) => in_flight.push(work),
                        Some(Dispatch::Ordered(work)) => {
                            if ordered.send(work).is_err() {
                                tracing::debug!(role = %self.role, "notification worker stopped");
                            }
                        }
                        None => {}
                    },
                    Some(PeerEvent::Closed(event)) => self.on_transport_closed(event).await,
                    Some(PeerEvent::Reconnect(event)) => self.on_reconnect_event(event).await,
                    None => break,
                }
            }
        }
        tracing::debug!(role = %self.role, abandoned = in_flight.len(), "dispatch loop finished");
        finished.cancel();
    }

    async fn on_transport_closed(&self, event: CloseEvent) {
        if event.will_reconnect {
            let failed = self.correlator.clear(CorrelationError::ConnectionClosed);
            for entry in self.inbound_cancels.iter() {
                entry.value().cancel();
            }
            self.health
                .set_state(ConnectionState::Connecting, Some(&event.reason));
            tracing::info!(role = %self.role, reason = %event.reason, failed_requests = failed, "connection lost; reconnecting");
            return;
        }
        let _ = self.lifecycle.transition(PeerState::Shutdown);
        self.teardown(&event.reason).await;
    }

    async fn on_reconnect_event(&self, event: ReconnectEvent) {
        match event {
            ReconnectEvent::Scheduled { attempt, delay_ms } => {
                tracing::debug!(attempt, delay_ms, "reconnect scheduled");
                self.health
                    .set_state(ConnectionState::Connecting, Some("reconnect scheduled"));
            }
            ReconnectEvent::Reconnected { attempt } => {
                tracing::info!(attempt, "transport reconnected");
                self.health
                    .set_state(ConnectionState::Connected, Some("reconnected"));
            }
            ReconnectEvent::GaveUp { attempts } => {
                tracing::warn!(attempts, "reconnect attempts exhausted");
                let _ = self.lifecycle.transition(PeerState::Shutdown);
                self.teardown("reconnect attempts exhausted").await;
            }
        }
    }

    /// Run one inbound message through the pipeline and dispatch it. Handler
    /// invocations come back as work so the loop keeps reading while they run.
    async fn handle_inbound(self: &Arc<Self>, message: Message) -> Option<Dispatch> {
        self.health.record_received();
        let method = match &message {
            Message::Response(response) => response
                .id
                .as_ref()
                .and_then(|id| self.correlator.get_metadata(id)),
            _ => None,
        };
        let mut ctx =
            MiddlewareContext::new(Direction::Inbound, message, self.transport_label()).with_method(method);
        let pipeline = self.pipeline.load_full();
        let outcome = pipeline.run(&mut ctx, &DeliverTerminal).await;
        let MiddlewareContext {
            message, metadata, ..
        } = ctx;

        match outcome {
            Err(e) => {
                tracing::error!(direction = "inbound", error = %e, "middleware failed");
                self.errors.emit(&e);
                if let Message::Request(request) = message {
                    self.reply(request.id, Err(e)).await;
                }
                None
            }
            Ok(Outcome::Settled(value)) => {
                match message {
                    Message::Request(request) => self.reply(request.id, Ok(value)).await,
                    Message::Response(Response { id: Some(id), .. }) => {
                        self.correlator.resolve(&id, value);
                    }
                    _ => {}
                }
                None
            }
            Ok(Outcome::Forwarded) => match message {
                Message::Response(response) => {
                    self.on_response(response);
                    None
                }
                Message::Notification(notification) => {
                    self.on_notification(notification).await.map(Dispatch::Ordered)
                }
                Message::Request(request) => {
                    self.on_request(request, metadata).await.map(Dispatch::Concurrent)
                }
            },
        }
    }

    fn on_response(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            if let Some(error) = response.error {
                tracing::warn!(error = %error, "error response without id");
                self.errors.emit(&RpcError::Remote(error));
            }
            return;
        };
        let settled = match response.into_result() {
            Ok(value) => self.correlator.resolve(&id, value),
            Err(error) => self.correlator.reject(&id, RpcError::Remote(error)),
        };
        if !settled {
            let error = CorrelationError::UnknownId(id);
            tracing::debug!(%error, "discarding late response");
        }
    }

    async fn on_notification(
        self: &Arc<Self>,
        notification: Notification,
    ) -> Option<BoxFuture<'static, ()>> {
        let Notification { method, params, .. } = notification;
        match method.as_str() {
            methods::CANCEL_REQUEST => {
                if let Some(id) = mc::parse_cancel_params(params) {
                    let token = self.inbound_cancels.get(&id).map(|entry| entry.value().clone());
                    match token {
                        Some(token) => {
                            tracing::debug!(id = %id, "remote cancelled request");
                            token.cancel();
                        }
                        None => tracing::trace!(id = %id, "cancel for request no longer running"),
                    }
                }
                return None;
            }
            methods::PROGRESS => {
                if let Some((token, value)) = mc::parse_progress_params(params.as_ref()) {
                    if self.partials.push(&token, value) {
                        return None;
                    }
                }
            }
            methods::EXIT if self.role == Role::Server => {
                tracing::info!(state = %self.lifecycle.state(), "exit received");
                let _ = self.lifecycle.transition(PeerState::Shutdown);
                self.teardown("exit received").await;
                return None;
            }
            methods::INITIALIZED if self.role == Role::Server => {
                match self
                    .lifecycle
                    .advance(PeerState::Initializing, PeerState::Initialized)
                {
                    Ok(()) => tracing::info!("client initialized"),
                    Err(e) => tracing::warn!(error = %e, "unexpected initialized notification"),
                }
            }
            _ => {}
        }

        if self.role == Role::Server
            && !matches!(
                self.lifecycle.state(),
                PeerState::Initialized | PeerState::ShuttingDown
            )
        {
            tracing::debug!(method = %method, "dropping notification before initialization");
            return None;
        }

        let Some(handler) = self.handlers.notification(&method) else {
            if method.starts_with("$/") {
                tracing::trace!(method = %method, "ignoring protocol notification");
            } else {
                tracing::debug!(method = %method, "no notification handler");
            }
            return None;
        };
        let params = match self.validate(&method, params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(method = %method, error = %e, "notification params rejected");
                self.errors.emit(&e);
                return None;
            }
        };
        let inner = Arc::clone(self);
        Some(
            async move {
                match AssertUnwindSafe(handler.handle(params)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(method = %method, error = %e, "notification handler failed");
                        inner.errors.emit(&e);
                    }
                    Err(_) => {
                        tracing::error!(method = %method, "notification handler panicked");
                        inner
                            .errors
                            .emit(&RpcError::handler(format!("handler for '{}' panicked", method)));
                    }
                }
            }
            .boxed(),
        )
    }

    fn require_initialized(&self, method: &str) -> Result<(), ProtocolError> {
        match self.lifecycle.state() {
            PeerState::Initialized => Ok(()),
            PeerState::ShuttingDown | PeerState::Shutdown => Err(ProtocolError::ShutDown {
                method: method.to_string(),
            }),
            PeerState::Created | PeerState::Initializing => Err(ProtocolError::NotInitialized {
                method: method.to_string(),
            }),
        }
    }

    fn accept_initialize(&self, params: Option<Value>) -> Result<Value, RpcError> {
        if self
            .lifecycle
            .advance(PeerState::Created, PeerState::Initializing)
            .is_err()
        {
            return Err(ProtocolError::AlreadyInitialized.into());
        }
        let params = match mc::parse_initialize_params(params) {
            Ok(params) => params,
            Err(e) => {
                let _ = self.lifecycle.transition(PeerState::Created);
                return Err(e.into());
            }
        };
        self.set_remote_capabilities(params.capabilities.clone());
        self.set_remote_info(mc::remote_info(params.client_info.as_ref(), None));
        tracing::info!(
            client = ?params.client_info.as_ref().map(|info| info.name.as_str()),
            process_id = ?params.process_id,
            "initialize received"
        );
        let mut result = mc::initialize_result(&self.config);
        result.capabilities = self.local_capabilities();
        serde_json::to_value(result).map_err(|e| RpcError::handler(e.to_string()))
    }

    fn accept_shutdown(&self) -> Result<Value, RpcError> {
        self.require_initialized(methods::SHUTDOWN)?;
        self.lifecycle.transition(PeerState::ShuttingDown)?;
        tracing::info!("shutdown requested");
        Ok(Value::Null)
    }

    fn accept_registration(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let registrations = mc::parse_registration_params(params).map_err(RpcError::InvalidParams)?;
        self.remote_registrations.register(registrations);
        Ok(Value::Null)
    }

    fn accept_unregistration(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let unregistrations = mc::parse_unregistration_params(params).map_err(RpcError::InvalidParams)?;
        self.remote_registrations
            .unregister(unregistrations.iter().map(|u| u.id.as_str()));
        Ok(Value::Null)
    }

    async fn on_request(
        self: &Arc<Self>,
        request: Request,
        metadata: Map<String, Value>,
    ) -> Option<BoxFuture<'static, ()>> {
        let Request {
            id, method, params, ..
        } = request;

        if self.role == Role::Server {
            let early = match method.as_str() {
                methods::INITIALIZE => Some(self.accept_initialize(params.clone())),
                methods::SHUTDOWN => Some(self.accept_shutdown()),
                _ => self.require_initialized(&method).err().map(|e| Err(e.into())),
            };
            if let Some(result) = early {
                self.reply(id, result).await;
                return None;
            }
        }
        match method.as_str() {
            methods::REGISTER_CAPABILITY => {
                let result = self.accept_registration(params);
                self.reply(id, result).await;
                return None;
            }
            methods::UNREGISTER_CAPABILITY => {
                let result = self.accept_unregistration(params);
                self.reply(id, result).await;
                return None;
            }
            _ => {}
        }

        let permitted = self
            .inbound_guard
            .load()
            .check(&method, &self.local_registrations);
        if let Err(e) = permitted {
            self.reply(id, Err(e.into())).await;
            return None;
        }
        let Some(handler) = self.handlers.request(&method) else {
            tracing::debug!(method = %method, "no request handler");
            self.reply(id, Err(RpcError::MethodNotFound(method))).await;
            return None;
        };
        let params = match self.validate(&method, params) {
            Ok(params) => params,
            Err(e) => {
                self.reply(id, Err(e)).await;
                return None;
            }
        };

        let cancel = CancellationToken::new();
        self.inbound_cancels.insert(id.clone(), cancel.clone());
        let ctx = RequestContext {
            id: id.clone(),
            method: method.clone(),
            cancel: cancel.clone(),
            metadata,
        };
        let inner = Arc::clone(self);
        Some(
            async move {
                let work = AssertUnwindSafe(handler.handle(params, ctx)).catch_unwind();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(RpcError::from(CorrelationError::Cancelled { id: id.clone() })),
                    outcome = work => match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            tracing::error!(method = %method, id = %id, "request handler panicked");
                            Err(RpcError::handler(format!("handler for '{}' panicked", method)))
                        }
                    },
                };
                inner.inbound_cancels.remove(&id);
                if let Err(e) = &result {
                    tracing::debug!(method = %method, id = %id, error = %e, "request failed");
                }
                inner.reply(id, result).await;
            }
            .boxed(),
        )
    }

    /// Prune handlers the inbound guard no longer permits. Non-strict guards
    /// keep everything.
    fn refresh_handlers(&self) {
        let guard = self.inbound_guard.load_full();
        if !guard.is_strict() {
            return;
        }
        let removed = self.handlers.retain(|method| {
            guard
                .check(method, &self.local_registrations)
                .unwrap_or(false)
        });
        for method in removed {
            tracing::info!(method = %method, "handler removed after capability unregistration");
        }
    }
}

/// Runs notification handlers one after another on their own task so a
/// handler may await responses the dispatch loop has yet to read. Work already
/// started finishes; queued work is dropped once `shutdown` fires.
fn spawn_ordered_worker(shutdown: CancellationToken) -> mpsc::UnboundedSender<BoxFuture<'static, ()>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
    tokio::spawn(async move {
        loop {
            let work = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                work = rx.recv() => match work {
                    Some(work) => work,
                    None => break,
                },
            };
            work.await;
        }
    });
    tx
}

/// A connection endpoint. Cheap to clone; clones share the same runtime.
#[derive(Clone)]
pub struct Peer {
    pub(crate) inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new(role: Role, config: PeerConfig) -> Self {
        let strict = config.strict_capabilities;
        let local_tree = CapabilityTree::new(config.capabilities.clone());
        let inbound = CapabilityGuard::new(GuardRole::Inbound, role.local_side(), local_tree, strict);
        let outbound = CapabilityGuard::new(
            GuardRole::Outbound,
            role.remote_side(),
            CapabilityTree::default(),
            strict,
        );
        Peer {
            inner: Arc::new(PeerInner {
                role,
                config,
                correlator: Correlator::new(),
                partials: PartialResultCollector::new(),
                outbound_guard: ArcSwap::from_pointee(outbound),
                inbound_guard: ArcSwap::from_pointee(inbound),
                remote_registrations: RegistrationStore::new(),
                local_registrations: RegistrationStore::new(),
                handlers: HandlerRegistry::new(),
                pipeline: ArcSwap::from_pointee(Pipeline::new()),
                validator: RwLock::new(None),
                lifecycle: Lifecycle::new(),
                health: HealthTracker::new(),
                remote_info: RwLock::new(None),
                inbound_cancels: DashMap::new(),
                errors: Listeners::new("peer.error"),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> PeerState {
        self.inner.lifecycle.state()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.inner.health
    }

    /// Label of the attached transport, or `"detached"`.
    pub fn transport_label(&self) -> String {
        self.inner.transport_label()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport().is_some_and(|t| t.is_connected())
    }

    pub fn remote_capabilities(&self) -> CapabilityTree {
        self.inner.outbound_guard.load().tree().clone()
    }

    pub fn local_capabilities(&self) -> CapabilityTree {
        self.inner.inbound_guard.load().tree().clone()
    }

    pub fn remote_info(&self) -> Option<PeerInfo> {
        self.inner.remote_info.read().clone()
    }

    /// Registrations the remote made with us.
    pub fn remote_registrations(&self) -> &RegistrationStore {
        &self.inner.remote_registrations
    }

    /// Registrations we made with the remote and it acknowledged.
    pub fn local_registrations(&self) -> &RegistrationStore {
        &self.inner.local_registrations
    }

    pub fn pending_requests(&self) -> Vec<RequestId> {
        self.inner.correlator.pending_ids()
    }

    /// Replace the local capability tree. Only allowed before the handshake;
    /// the inbound guard is rebuilt from it.
    pub fn declare_capabilities(&self, capabilities: Value) -> Result<(), RpcError> {
        if self.state() != PeerState::Created {
            return Err(ProtocolError::InvalidState(format!(
                "capabilities are fixed once the handshake started (state {})",
                self.state()
            ))
            .into());
        }
        let guard = self
            .inner
            .build_guard(GuardRole::Inbound, CapabilityTree::new(capabilities));
        self.inner.inbound_guard.store(Arc::new(guard));
        self.inner.refresh_handlers();
        Ok(())
    }

    /// Register a request handler. Checked against the local capabilities:
    /// strict peers refuse undeclared methods.
    pub fn on_request(&self, method: &str, handler: Arc<dyn RequestHandler>) -> Result<(), RpcError> {
        self.inner
            .inbound_guard
            .load()
            .check(method, &self.inner.local_registrations)?;
        if self.inner.handlers.insert_request(method, handler) {
            tracing::debug!(method, "request handler replaced");
        }
        Ok(())
    }

    pub fn on_notification(&self, method: &str, handler: Arc<dyn NotificationHandler>) -> Result<(), RpcError> {
        self.inner
            .inbound_guard
            .load()
            .check(method, &self.inner.local_registrations)?;
        if self.inner.handlers.insert_notification(method, handler) {
            tracing::debug!(method, "notification handler replaced");
        }
        Ok(())
    }

    pub fn remove_handler(&self, method: &str) -> bool {
        self.inner.handlers.remove(method)
    }

    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.pipeline.rcu(|pipeline| {
            let mut next = Pipeline::clone(pipeline);
            next.push(Arc::clone(&middleware));
            next
        });
    }

    pub fn use_scoped_middleware(&self, prefix: &str, middleware: Arc<dyn Middleware>) {
        self.inner.pipeline.rcu(|pipeline| {
            let mut next = Pipeline::clone(pipeline);
            next.scoped(prefix, Arc::clone(&middleware));
            next
        });
    }

    pub fn set_validator(&self, validator: Arc<dyn ParamsValidator>) {
        *self.inner.validator.write() = Some(validator);
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(callback)
    }

    pub fn on_lifecycle<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.inner.lifecycle.on_transition(callback)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.request_with(method, params, RequestOptions::default()).await
    }

    /// Send a request and await its settlement.
    ///
    /// Dropping the returned future while the request is pending rejects it
    /// locally and sends `$/cancelRequest`. A timed-out request is also
    /// announced to the remote as cancelled.
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, RpcError> {
        let inner = &self.inner;
        inner.check_outbound(method, true)?;
        let timeout = options.resolve_timeout(inner.config.request_timeout);
        let (id, mut pending) = inner.correlator.create(method, timeout);
        let mut on_drop = CancelOnDrop {
            inner: Arc::clone(inner),
            id: id.clone(),
            armed: true,
        };

        let request = Request::new(id.clone(), method, params);
        match inner.send_message(request.into()).await {
            Ok(Outcome::Forwarded) => {}
            Ok(Outcome::Settled(value)) => {
                inner.correlator.resolve(&id, value);
            }
            Err(e) => {
                inner.correlator.reject(&id, e);
            }
        }

        let result = match &options.cancel {
            None => (&mut pending).await,
            Some(token) => {
                let raced = tokio::select! {
                    result = &mut pending => Some(result),
                    _ = token.cancelled() => None,
                };
                match raced {
                    Some(result) => result,
                    None => {
                        inner.cancel_outbound(&id).await;
                        (&mut pending).await
                    }
                }
            }
        };
        on_drop.armed = false;

        if let Err(e) = &result {
            if e.is_timeout() {
                tracing::debug!(id = %id, method, "request timed out; notifying remote");
                inner.send_cancel_notification(&id).await;
            }
        }
        result
    }

    /// Like [`request_with`](Self::request_with), streaming partial results
    /// to `on_partial`. The params carry a fresh `partialResultToken`; `null`
    /// params become `{}` and any other non-object params are rejected.
    pub async fn request_with_partials<F>(
        &self,
        method: &str,
        params: Option<Value>,
        on_partial: F,
        options: RequestOptions,
    ) -> Result<Value, RpcError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut params = match params {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(RpcError::InvalidParams(format!(
                    "{} params must be an object to carry a {}",
                    method, PARTIAL_RESULT_TOKEN_FIELD
                )))
            }
        };
        let token = self.inner.partials.next_token();
        params.insert(PARTIAL_RESULT_TOKEN_FIELD.to_string(), serde_json::json!(token));
        self.inner.partials.start(&token, on_partial);
        let _stream = PartialStream {
            partials: &self.inner.partials,
            token,
        };
        self.request_with(method, Some(Value::Object(params)), options)
            .await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        self.inner.check_outbound(method, false)?;
        match self
            .inner
            .send_message(Notification::new(method, params).into())
            .await?
        {
            Outcome::Forwarded => {}
            Outcome::Settled(_) => tracing::debug!(method, "notification withheld by middleware"),
        }
        Ok(())
    }

    /// Report a partial result (or any progress value) for `token`.
    pub async fn send_progress(&self, token: &ProgressToken, value: Value) -> Result<(), RpcError> {
        self.notify(methods::PROGRESS, Some(mc::progress_params(token, value)))
            .await
    }

    /// Cancel an outbound request by id. Returns `false` when the id is no
    /// longer pending; no notification is sent in that case.
    pub async fn cancel_request(&self, id: &RequestId) -> bool {
        self.inner.cancel_outbound(id).await
    }

    /// Announce capabilities we now support; recorded once the remote acks.
    pub async fn register_capability(&self, registrations: Vec<Registration>) -> Result<(), RpcError> {
        let params = mc::registration_params(registrations.clone());
        self.request(methods::REGISTER_CAPABILITY, Some(params)).await?;
        self.inner.local_registrations.register(registrations);
        Ok(())
    }

    /// Withdraw registrations by id. Handlers the inbound guard no longer
    /// permits are dropped from the dispatch table.
    pub async fn unregister_capability(&self, ids: &[&str]) -> Result<(), RpcError> {
        let local = &self.inner.local_registrations;
        let params = mc::unregistration_params(ids.iter().copied(), |id| local.get(id).map(|r| r.method));
        self.request(methods::UNREGISTER_CAPABILITY, Some(params)).await?;
        local.unregister(ids.iter().copied());
        self.inner.refresh_handlers();
        Ok(())
    }

    /// Attach a transport without a handshake; used by servers, which wait
    /// for the client to initiate.
    pub async fn attach(&self, transport: Arc<dyn Transport>) -> Result<(), RpcError> {
        self.inner.attach(transport).await
    }

    /// Close the transport and fail everything in flight.
    pub async fn close(&self) {
        let _ = self.inner.lifecycle.transition(PeerState::Shutdown);
        self.inner.teardown("closed by local peer").await;
    }

    /// Resolves once the current connection's dispatch loop has stopped.
    pub async fn closed(&self) {
        let finished = self
            .inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }
}
