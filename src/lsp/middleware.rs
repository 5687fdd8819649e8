//! Interceptor chain wrapped around every inbound and outbound message.
use crate::lsp::error::RpcError;
use crate::lsp::types::{Message, MessageKind};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// State of one message's pass through the pipeline.
///
/// `message` may be rewritten by interceptors; whatever it holds when the
/// terminal step runs is what gets sent or dispatched. `metadata` is scratch
/// space that lives for this pass only.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub direction: Direction,
    pub kind: MessageKind,
    /// For responses this is the method of the originating request, when known.
    pub method: Option<String>,
    pub message: Message,
    pub metadata: Map<String, Value>,
    pub transport_label: String,
}

impl MiddlewareContext {
    pub fn new(direction: Direction, message: Message, transport_label: impl Into<String>) -> Self {
        MiddlewareContext {
            direction,
            kind: message.kind(),
            method: message.method().map(str::to_string),
            message,
            metadata: Map::new(),
            transport_label: transport_label.into(),
        }
    }

    pub fn with_method(mut self, method: Option<String>) -> Self {
        if self.method.is_none() {
            self.method = method;
        }
        self
    }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The terminal step ran; the message continues on its normal path.
    Forwarded,
    /// Settled by an interceptor. Outbound requests resolve with this value;
    /// inbound requests are answered with it instead of reaching a handler.
    Settled(Value),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Call `next.run(ctx)` to continue, or return without calling it to
    /// short-circuit the remaining interceptors and the terminal step.
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// The I/O step at the end of the chain.
#[async_trait]
pub trait MiddlewareTerminal: Send + Sync {
    async fn call(&self, ctx: &mut MiddlewareContext) -> Result<Outcome, RpcError>;
}

/// Continuation handed to each interceptor. Consumed by `run`, so it can be
/// invoked at most once.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn MiddlewareTerminal,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<Outcome, RpcError> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

#[derive(Clone)]
struct Entry {
    prefix: Option<String>,
    middleware: Arc<dyn Middleware>,
}

impl Entry {
    fn applies_to(&self, method: Option<&str>) -> bool {
        match (&self.prefix, method) {
            (None, _) => true,
            (Some(prefix), Some(method)) => method.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// Ordered interceptors; the same order applies in both directions.
#[derive(Clone, Default)]
pub struct Pipeline {
    entries: Vec<Entry>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.entries.push(Entry {
            prefix: None,
            middleware,
        });
    }

    /// Only runs for messages whose method starts with `prefix`.
    pub fn scoped(&mut self, prefix: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.entries.push(Entry {
            prefix: Some(prefix.into()),
            middleware,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn run(
        &self,
        ctx: &mut MiddlewareContext,
        terminal: &dyn MiddlewareTerminal,
    ) -> Result<Outcome, RpcError> {
        let chain: Vec<Arc<dyn Middleware>> = self
            .entries
            .iter()
            .filter(|entry| entry.applies_to(ctx.method.as_deref()))
            .map(|entry| Arc::clone(&entry.middleware))
            .collect();
        Next {
            rest: &chain,
            terminal,
        }
        .run(ctx)
        .await
    }
}

/// Traces every message with its direction and how long the rest of the
/// chain took.
#[derive(Debug, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
        let started = Instant::now();
        let direction = ctx.direction;
        let kind = ctx.kind;
        let method = ctx.method.clone().unwrap_or_default();
        let id = ctx.message.id().map(|id| id.to_string());
        tracing::debug!(%direction, %kind, method = %method, id = ?id, transport = %ctx.transport_label, "message");

        let outcome = next.run(ctx).await;

        let elapsed_us = started.elapsed().as_micros() as u64;
        match &outcome {
            Ok(Outcome::Forwarded) => tracing::trace!(%direction, method = %method, elapsed_us, "forwarded"),
            Ok(Outcome::Settled(_)) => tracing::debug!(%direction, method = %method, elapsed_us, "settled by middleware"),
            Err(e) => tracing::warn!(%direction, method = %method, error = %e, "middleware chain failed"),
        }
        outcome
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::types::{Notification, Request, RequestId};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recording {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
            self.log.lock().push(format!("{}:before", self.tag));
            ctx.metadata.insert(self.tag.to_string(), json!(true));
            let outcome = next.run(ctx).await;
            self.log.lock().push(format!("{}:after", self.tag));
            outcome
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Outcome, RpcError> {
            if ctx.method.as_deref() == Some("foo") {
                return Ok(Outcome::Settled(json!("short")));
            }
            next.run(ctx).await
        }
    }

    struct Failing;

    #[async_trait]
    impl Middleware for Failing {
        async fn handle(&self, _ctx: &mut MiddlewareContext, _next: Next<'_>) -> Result<Outcome, RpcError> {
            Err(RpcError::Middleware("rejected".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingTerminal {
        calls: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl MiddlewareTerminal for CountingTerminal {
        async fn call(&self, ctx: &mut MiddlewareContext) -> Result<Outcome, RpcError> {
            self.calls.lock().push(Value::Object(ctx.metadata.clone()));
            Ok(Outcome::Forwarded)
        }
    }

    fn request(method: &str) -> MiddlewareContext {
        let message = Request::new(RequestId::Number(1), method, Some(json!({}))).into();
        MiddlewareContext::new(Direction::Outbound, message, "test")
    }

    #[tokio::test]
    async fn test_interceptors_wrap_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        for tag in ["a", "b"] {
            pipeline.push(Arc::new(Recording {
                tag,
                log: Arc::clone(&log),
            }));
        }
        let terminal = CountingTerminal::default();
        let mut ctx = request("textDocument/hover");

        let outcome = pipeline.run(&mut ctx, &terminal).await.unwrap();
        assert_eq!(outcome, Outcome::Forwarded);
        assert_eq!(*log.lock(), vec!["a:before", "b:before", "b:after", "a:after"]);
        assert_eq!(terminal.calls.lock()[0], json!({"a": true, "b": true}));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Arc::new(ShortCircuit));
        let terminal = CountingTerminal::default();

        let mut ctx = request("foo");
        let outcome = pipeline.run(&mut ctx, &terminal).await.unwrap();
        assert_eq!(outcome, Outcome::Settled(json!("short")));
        assert!(terminal.calls.lock().is_empty());

        let mut ctx = request("bar");
        pipeline.run(&mut ctx, &terminal).await.unwrap();
        assert_eq!(terminal.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_error_unwinds_through_entered_interceptors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.push(Arc::new(Recording {
            tag: "outer",
            log: Arc::clone(&log),
        }));
        pipeline.push(Arc::new(Failing));
        let terminal = CountingTerminal::default();

        let err = pipeline.run(&mut request("x"), &terminal).await.unwrap_err();
        assert_eq!(err, RpcError::Middleware("rejected".to_string()));
        assert_eq!(*log.lock(), vec!["outer:before", "outer:after"]);
        assert!(terminal.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_scoped_interceptor_only_sees_its_prefix() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.scoped(
            "textDocument/",
            Arc::new(Recording {
                tag: "td",
                log: Arc::clone(&log),
            }),
        );
        let terminal = CountingTerminal::default();

        pipeline.run(&mut request("workspace/symbol"), &terminal).await.unwrap();
        assert!(log.lock().is_empty());

        let message = Notification::new("textDocument/didOpen", None).into();
        let mut ctx = MiddlewareContext::new(Direction::Inbound, message, "test");
        pipeline.run(&mut ctx, &terminal).await.unwrap();
        assert_eq!(*log.lock(), vec!["td:before", "td:after"]);
    }
}
