//! Client and server peers talking over the in-memory channel pair.

use async_trait::async_trait;
use lsp_peer::lsp::capability::CapabilityTree;
use lsp_peer::lsp::channel_transport::{memory_channel_pair, ChannelConnector, ChannelHalves};
use lsp_peer::lsp::error::{codes, CapabilityError, CorrelationError, TransportError};
use lsp_peer::lsp::health::ConnectionState;
use lsp_peer::lsp::middleware::Direction;
use lsp_peer::lsp::{
    notification_fn, request_fn, ChannelTransport, Client, HeartbeatConfig, Message, Middleware,
    MiddlewareContext, Next, Outcome, PeerConfig, PeerState, ReconnectPolicy, Request, RequestId,
    RequestOptions, RpcError, Server, Transport,
};
use lsp_types::{ProgressToken, Registration};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

async fn connect(client: &Client, server: &Server) {
    let (a, b) = ChannelTransport::memory_pair();
    server.listen(Arc::new(b)).await.unwrap();
    client.connect(Arc::new(a)).await.unwrap();
}

fn echo_server(capabilities: Value) -> Server {
    let server = Server::new(PeerConfig::default().with_capabilities(capabilities));
    server
        .on_request("test/echo", request_fn(|params, _| async move { Ok::<_, RpcError>(params) }))
        .unwrap();
    server
}

async fn eventually(check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", WAIT);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn remote_code(err: RpcError) -> i32 {
    match err {
        RpcError::Remote(error) => error.code,
        other => panic!("expected a remote error, got {other:?}"),
    }
}

/// Records the method of every inbound message it sees.
#[derive(Default)]
struct InboundMethods {
    seen: Mutex<Vec<String>>,
}

impl InboundMethods {
    fn count(&self, method: &str) -> usize {
        self.seen.lock().iter().filter(|m| m.as_str() == method).count()
    }
}

#[async_trait]
impl Middleware for InboundMethods {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
        if ctx.direction == Direction::Inbound {
            if let Some(method) = &ctx.method {
                self.seen.lock().push(method.clone());
            }
        }
        next.run(ctx).await
    }
}

struct ShortCircuitFoo;

#[async_trait]
impl Middleware for ShortCircuitFoo {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
        if ctx.method.as_deref() == Some("foo") {
            return Ok(Outcome::Settled(json!({"short": true})));
        }
        next.run(ctx).await
    }
}

/// Records the error code of every inbound error response.
#[derive(Default)]
struct InboundErrorCodes {
    codes: Mutex<Vec<i32>>,
}

#[async_trait]
impl Middleware for InboundErrorCodes {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
        if ctx.direction == Direction::Inbound {
            if let Message::Response(response) = &ctx.message {
                if let Some(error) = &response.error {
                    self.codes.lock().push(error.code);
                }
            }
        }
        next.run(ctx).await
    }
}

/// Fails the first outbound `initialized` notification.
#[derive(Default)]
struct FailFirstInitialized {
    tripped: AtomicBool,
}

#[async_trait]
impl Middleware for FailFirstInitialized {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
        if ctx.direction == Direction::Outbound
            && ctx.method.as_deref() == Some("initialized")
            && !self.tripped.swap(true, Ordering::SeqCst)
        {
            return Err(RpcError::Middleware("initialized blocked".to_string()));
        }
        next.run(ctx).await
    }
}

/// Dials `server` once; every later attempt is refused.
struct OneShotConnector {
    server: Server,
    used: AtomicBool,
}

#[async_trait]
impl ChannelConnector for OneShotConnector {
    async fn connect(&self) -> Result<ChannelHalves, TransportError> {
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (local, remote) = memory_channel_pair();
        self.server
            .listen(Arc::new(ChannelTransport::server(remote)))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(local)
    }
}

fn waiting_server(started: mpsc::UnboundedSender<()>) -> Server {
    let server = echo_server(json!({}));
    server
        .on_request(
            "test/wait",
            request_fn(move |_, _| {
                let started = started.clone();
                async move {
                    let _ = started.send(());
                    std::future::pending::<()>().await;
                    Ok::<_, RpcError>(Value::Null)
                }
            }),
        )
        .unwrap();
    server
}

#[tokio::test]
async fn test_handshake_exchanges_capabilities() {
    let server = echo_server(json!({"hoverProvider": true}));
    let client = Client::new(PeerConfig::default().with_capabilities(json!({"workspace": {"applyEdit": true}})));
    connect(&client, &server).await;

    assert_eq!(client.state(), PeerState::Initialized);
    assert!(client.remote_capabilities().is_enabled("hoverProvider"));
    assert_eq!(client.health().state(), ConnectionState::Connected);

    // A round-trip guarantees the server has processed `initialized`.
    let echoed = client.request("test/echo", Some(json!({"n": 1}))).await.unwrap();
    assert_eq!(echoed, json!({"n": 1}));
    assert_eq!(server.state(), PeerState::Initialized);
    assert!(server.remote_capabilities().is_enabled("workspace.applyEdit"));
    assert_eq!(server.remote_info().map(|info| info.name), Some(env!("CARGO_PKG_NAME").to_string()));
}

#[tokio::test]
async fn test_outbound_guard_strict_rejects_undeclared_method() {
    let server = echo_server(json!({"hoverProvider": true}));
    server
        .on_request("textDocument/hover", request_fn(|_, _| async { Ok::<_, RpcError>(json!({"contents": "doc"})) }))
        .unwrap();
    let client = Client::new(PeerConfig::default().strict(true));
    connect(&client, &server).await;

    let hover = client.request("textDocument/hover", Some(json!({}))).await.unwrap();
    assert_eq!(hover, json!({"contents": "doc"}));

    let err = client.request("textDocument/definition", Some(json!({}))).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Capability(CapabilityError::Unsupported {
            method: "textDocument/definition".to_string(),
            path: "definitionProvider".to_string(),
        })
    );
    assert!(client.pending_requests().is_empty());
}

#[tokio::test]
async fn test_outbound_guard_lenient_still_sends() {
    let server = echo_server(json!({"hoverProvider": true}));
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    // Sent despite the missing capability; the server has no handler for it.
    let err = client.request("textDocument/definition", Some(json!({}))).await.unwrap_err();
    assert_eq!(remote_code(err), codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_request_times_out_and_remote_is_told() {
    let server = echo_server(json!({}));
    let observed = Arc::new(InboundMethods::default());
    server.use_middleware(observed.clone());
    server
        .on_request(
            "test/slow",
            request_fn(|_, ctx| async move {
                ctx.cancel.cancelled().await;
                Ok::<_, RpcError>(Value::Null)
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let started = Instant::now();
    let err = client
        .request_with("test/slow", None, RequestOptions::new().timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(client.pending_requests().is_empty());

    eventually(|| observed.count("$/cancelRequest") == 1).await;
}

#[tokio::test]
async fn test_middleware_short_circuit_skips_the_wire() {
    let server = echo_server(json!({}));
    let observed = Arc::new(InboundMethods::default());
    server.use_middleware(observed.clone());
    let client = Client::new(PeerConfig::default());
    client.use_middleware(Arc::new(ShortCircuitFoo));
    connect(&client, &server).await;

    let value = client.request("foo", Some(json!([1]))).await.unwrap();
    assert_eq!(value, json!({"short": true}));
    assert!(client.pending_requests().is_empty());

    client.request("test/echo", None).await.unwrap();
    assert_eq!(observed.count("foo"), 0);
    assert_eq!(observed.count("test/echo"), 1);
}

#[tokio::test]
async fn test_cancellation_is_idempotent() {
    let server = echo_server(json!({}));
    let observed = Arc::new(InboundMethods::default());
    server.use_middleware(observed.clone());
    let (tx, mut started) = mpsc::unbounded_channel();
    server
        .on_request(
            "test/wait",
            request_fn(move |_, ctx| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                    ctx.cancel.cancelled().await;
                    Ok::<_, RpcError>(Value::Null)
                }
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let token = CancellationToken::new();
    let call = {
        let client = client.clone();
        let options = RequestOptions::new().cancel_token(token.clone());
        tokio::spawn(async move { client.request_with("test/wait", None, options).await })
    };
    tokio::time::timeout(WAIT, started.recv()).await.unwrap().unwrap();
    let id = client.pending_requests().pop().unwrap();

    token.cancel();
    token.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    assert!(!client.cancel_request(&id).await);

    // The handshake request is long settled.
    assert!(!client.cancel_request(&RequestId::Number(1)).await);

    client.request("test/echo", None).await.unwrap();
    assert_eq!(observed.count("$/cancelRequest"), 1);
}

#[tokio::test]
async fn test_dropping_request_future_cancels_remotely() {
    let server = echo_server(json!({}));
    let observed = Arc::new(InboundMethods::default());
    server.use_middleware(observed.clone());
    server
        .on_request(
            "test/wait",
            request_fn(|_, ctx| async move {
                ctx.cancel.cancelled().await;
                Ok::<_, RpcError>(Value::Null)
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let outcome = tokio::time::timeout(Duration::from_millis(30), client.request("test/wait", None)).await;
    assert!(outcome.is_err());
    assert!(client.pending_requests().is_empty());
    eventually(|| observed.count("$/cancelRequest") == 1).await;
}

#[tokio::test]
async fn test_second_initialize_is_a_protocol_error() {
    let server = echo_server(json!({}));
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let err = client
        .request("initialize", Some(json!({"processId": null, "capabilities": {}})))
        .await
        .unwrap_err();
    assert_eq!(remote_code(err), codes::INVALID_REQUEST);
    assert_eq!(server.state(), PeerState::Initialized);
}

#[tokio::test]
async fn test_server_rejects_requests_before_handshake() {
    let server = echo_server(json!({}));
    let (raw, b) = ChannelTransport::memory_pair();
    server.listen(Arc::new(b)).await.unwrap();

    let (tx, mut replies) = mpsc::unbounded_channel();
    let _sub = raw.on_message(Box::new(move |message: &Message| {
        let _ = tx.send(message.clone());
    }));
    raw.open().await.unwrap();
    raw.send(Request::new(RequestId::from("early"), "test/echo", Some(json!(1))).into())
        .await
        .unwrap();

    let reply = tokio::time::timeout(WAIT, replies.recv()).await.unwrap().unwrap();
    match reply {
        Message::Response(response) => {
            assert_eq!(response.id, Some(RequestId::from("early")));
            assert_eq!(response.error.map(|e| e.code), Some(codes::SERVER_NOT_INITIALIZED));
        }
        other => panic!("unexpected message {other:?}"),
    }
    assert_eq!(server.state(), PeerState::Created);
}

#[tokio::test]
async fn test_dynamic_registration_unlocks_strict_guard() {
    let server = Server::new(PeerConfig::default());
    server
        .on_request("textDocument/formatting", request_fn(|_, _| async { Ok::<_, RpcError>(json!([])) }))
        .unwrap();
    let client = Client::new(PeerConfig::default().strict(true));
    connect(&client, &server).await;

    let before = client.request("textDocument/formatting", Some(json!({}))).await;
    assert!(matches!(before, Err(RpcError::Capability(_))));

    server
        .register_capability(vec![Registration {
            id: "fmt".to_string(),
            method: "textDocument/formatting".to_string(),
            register_options: None,
        }])
        .await
        .unwrap();
    assert!(client.remote_registrations().contains_method("textDocument/formatting"));
    assert!(server.local_registrations().contains_method("textDocument/formatting"));
    assert_eq!(client.request("textDocument/formatting", Some(json!({}))).await.unwrap(), json!([]));

    server.unregister_capability(&["fmt"]).await.unwrap();
    assert!(!client.remote_registrations().contains_method("textDocument/formatting"));
    assert!(server.local_registrations().is_empty());
    let after = client.request("textDocument/formatting", Some(json!({}))).await;
    assert!(matches!(after, Err(RpcError::Capability(_))));
}

#[tokio::test]
async fn test_partial_results_stream_before_final_value() {
    let server = Server::new(PeerConfig::default().with_capabilities(json!({"workspaceSymbolProvider": true})));
    let progress = server.clone();
    server
        .on_request(
            "workspace/symbol",
            request_fn(move |params, _| {
                let progress = progress.clone();
                async move {
                    let token: ProgressToken = serde_json::from_value(params["partialResultToken"].clone())
                        .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
                    progress.send_progress(&token, json!([{"name": "a"}])).await?;
                    progress.send_progress(&token, json!([{"name": "b"}])).await?;
                    Ok::<_, RpcError>(json!([]))
                }
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let partials = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&partials);
    let result = client
        .request_with_partials(
            "workspace/symbol",
            Some(json!({"query": ""})),
            move |value| sink.lock().push(value.clone()),
            RequestOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(result, json!([]));
    assert_eq!(*partials.lock(), vec![json!([{"name": "a"}]), json!([{"name": "b"}])]);

    let err = client
        .request_with_partials("workspace/symbol", Some(json!([1])), |_| {}, RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidParams(_)));
}

#[tokio::test]
async fn test_unknown_method_and_panicking_handler() {
    let server = echo_server(json!({}));
    server
        .on_request(
            "test/panic",
            request_fn(|params: Value, _| async move {
                if params.is_null() {
                    panic!("handler exploded");
                }
                Ok::<_, RpcError>(params)
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let err = client.request("custom/unknown", None).await.unwrap_err();
    assert_eq!(remote_code(err), codes::METHOD_NOT_FOUND);

    let err = client.request("test/panic", None).await.unwrap_err();
    assert_eq!(remote_code(err), codes::INTERNAL_ERROR);

    // The runtime survives the panic.
    assert_eq!(client.request("test/echo", Some(json!("still here"))).await.unwrap(), json!("still here"));
}

#[tokio::test]
async fn test_disconnect_shuts_both_peers_down() {
    let server = echo_server(json!({}));
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;
    client.request("test/echo", None).await.unwrap();

    client.disconnect().await;
    assert_eq!(client.state(), PeerState::Shutdown);
    assert_eq!(client.health().state(), ConnectionState::Disconnected);
    assert!(!client.is_connected());

    tokio::time::timeout(WAIT, server.closed()).await.unwrap();
    assert_eq!(server.state(), PeerState::Shutdown);

    let err = client.request("test/echo", None).await.unwrap_err();
    assert!(matches!(err, RpcError::Protocol(_)));
}

#[tokio::test]
async fn test_failed_handshake_resets_client() {
    // No server on the other end: the initialize request can only time out.
    let (a, _b) = ChannelTransport::memory_pair();
    let client = Client::new(PeerConfig::default().with_request_timeout(Some(Duration::from_millis(30))));
    let err = client.connect(Arc::new(a)).await.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert_eq!(client.state(), PeerState::Created);
    assert!(!client.is_connected());
    assert_eq!(client.remote_capabilities().as_value(), CapabilityTree::default().as_value());

    let server = echo_server(json!({"hoverProvider": true}));
    connect(&client, &server).await;
    assert_eq!(client.state(), PeerState::Initialized);
}

#[tokio::test]
async fn test_failure_after_initialize_reply_forgets_the_server() {
    let server = echo_server(json!({"hoverProvider": true}));
    let client = Client::new(PeerConfig::default());
    client.use_middleware(Arc::new(FailFirstInitialized::default()));

    let (a, b) = ChannelTransport::memory_pair();
    server.listen(Arc::new(b)).await.unwrap();
    let err = client.connect(Arc::new(a)).await.unwrap_err();
    assert!(matches!(err, RpcError::Middleware(_)), "{err:?}");
    assert_eq!(client.state(), PeerState::Created);
    assert!(!client.is_connected());
    assert!(!client.remote_capabilities().is_enabled("hoverProvider"));
    assert_eq!(client.remote_capabilities().as_value(), CapabilityTree::default().as_value());
    assert!(client.remote_info().is_none());

    let retry = echo_server(json!({"definitionProvider": true}));
    connect(&client, &retry).await;
    assert_eq!(client.state(), PeerState::Initialized);
    assert!(client.remote_capabilities().is_enabled("definitionProvider"));
    assert!(client.remote_info().is_some());
}

#[tokio::test]
async fn test_notification_handler_can_await_a_request() {
    let server = echo_server(json!({}));
    let (tx, mut answers) = mpsc::unbounded_channel();
    let requester = server.clone();
    server
        .on_notification(
            "workspace/didChangeConfiguration",
            notification_fn(move |_| {
                let requester = requester.clone();
                let tx = tx.clone();
                async move {
                    let options = RequestOptions::new().timeout(Duration::from_millis(500));
                    let answer = requester
                        .request_with("workspace/configuration", Some(json!({"items": [{}]})), options)
                        .await;
                    let _ = tx.send(answer);
                    Ok::<_, RpcError>(())
                }
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    client
        .on_request("workspace/configuration", request_fn(|_, _| async { Ok::<_, RpcError>(json!([1])) }))
        .unwrap();
    connect(&client, &server).await;

    client
        .notify("workspace/didChangeConfiguration", Some(json!({"settings": {}})))
        .await
        .unwrap();
    let answer = tokio::time::timeout(WAIT, answers.recv()).await.unwrap().unwrap();
    assert_eq!(answer.unwrap(), json!([1]));
}

#[tokio::test]
async fn test_notification_handlers_run_in_receipt_order() {
    let server = echo_server(json!({}));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    server
        .on_notification(
            "test/note",
            notification_fn(move |params: Value| {
                let sink = Arc::clone(&sink);
                async move {
                    // Earlier notifications sleep longer.
                    let n = params["n"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(20 - n * 5)).await;
                    sink.lock().push(n);
                    Ok::<_, RpcError>(())
                }
            }),
        )
        .unwrap();
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    for n in 0..4u64 {
        client.notify("test/note", Some(json!({"n": n}))).await.unwrap();
    }
    eventually(|| seen.lock().len() == 4).await;
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_lost_connection_fails_pending_requests() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let server = waiting_server(started_tx);
    let client = Client::new(PeerConfig::default());
    connect(&client, &server).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("test/wait", None).await })
    };
    tokio::time::timeout(WAIT, started.recv()).await.unwrap().unwrap();

    server.close().await;
    let err = tokio::time::timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err, RpcError::Correlation(CorrelationError::ConnectionClosed));
    assert!(client.pending_requests().is_empty());
    eventually(|| client.state() == PeerState::Shutdown).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_reconnecting_transport_fails_pending_then_gives_up() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let server = waiting_server(started_tx);
    let connector = Arc::new(OneShotConnector {
        server: server.clone(),
        used: AtomicBool::new(false),
    });
    let policy = ReconnectPolicy {
        enabled: true,
        base_delay: Duration::from_millis(50),
        multiplier: 2.0,
        max_delay: Duration::from_millis(100),
        max_attempts: 2,
    };
    let client = Client::new(PeerConfig::default());
    client
        .connect(Arc::new(ChannelTransport::client(connector, policy)))
        .await
        .unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("test/wait", None).await })
    };
    tokio::time::timeout(WAIT, started.recv()).await.unwrap().unwrap();

    server.close().await;
    let err = tokio::time::timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err, RpcError::Correlation(CorrelationError::ConnectionClosed));
    // Still mid-session while the transport retries.
    assert_eq!(client.state(), PeerState::Initialized);

    eventually(|| client.state() == PeerState::Shutdown).await;
    eventually(|| client.health().state() == ConnectionState::Disconnected).await;
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_remote_cancellation_answers_request_cancelled() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let server = waiting_server(started_tx);
    let client = Client::new(PeerConfig::default());
    let observed = Arc::new(InboundErrorCodes::default());
    client.use_middleware(observed.clone());
    connect(&client, &server).await;

    let token = CancellationToken::new();
    let call = {
        let client = client.clone();
        let options = RequestOptions::new().cancel_token(token.clone());
        tokio::spawn(async move { client.request_with("test/wait", None, options).await })
    };
    tokio::time::timeout(WAIT, started.recv()).await.unwrap().unwrap();

    token.cancel();
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    eventually(|| observed.codes.lock().contains(&codes::REQUEST_CANCELLED)).await;

    // The server keeps serving after abandoning the handler.
    assert_eq!(client.request("test/echo", Some(json!(7))).await.unwrap(), json!(7));
}

#[tokio::test]
async fn test_configured_heartbeat_pings_and_tracks_silence() {
    let server = echo_server(json!({}));
    let observed = Arc::new(InboundMethods::default());
    server.use_middleware(observed.clone());
    let heartbeat = HeartbeatConfig {
        interval: Duration::from_millis(20),
        responsiveness_window: Duration::from_millis(60),
        ping_method: Some("$/ping".to_string()),
    };
    let client = Client::new(PeerConfig::default().with_heartbeat(heartbeat));
    connect(&client, &server).await;
    assert!(client.health().heartbeat().is_some());

    eventually(|| observed.count("$/ping") >= 2).await;
    // The server never answers pings, so the client goes quiet.
    eventually(|| !client.health().is_healthy()).await;

    client.request("test/echo", None).await.unwrap();
    assert!(client.health().is_healthy());

    client.disconnect().await;
    assert!(client.health().heartbeat().is_none());
}
