//! Request/notification handlers and the method-keyed dispatch table.
use crate::lsp::error::RpcError;
use crate::lsp::types::RequestId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call context handed to request handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: RequestId,
    pub method: String,
    /// Triggered when the remote sends `$/cancelRequest` for this id or the
    /// connection goes away.
    pub cancel: CancellationToken,
    /// Metadata written by inbound middleware.
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Value, ctx: RequestContext) -> Result<Value, RpcError>;
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<(), RpcError>;
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn handle(&self, params: Value, ctx: RequestContext) -> Result<Value, RpcError> {
        (self.0)(params, ctx).await
    }
}

struct FnNotificationHandler<F>(F);

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), RpcError>> + Send,
{
    async fn handle(&self, params: Value) -> Result<(), RpcError> {
        (self.0)(params).await
    }
}

pub fn request_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnRequestHandler(f))
}

pub fn notification_fn<F, Fut>(f: F) -> Arc<dyn NotificationHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    Arc::new(FnNotificationHandler(f))
}

/// Hook run on inbound params before dispatch. Returning an error answers the
/// request with InvalidParams.
pub trait ParamsValidator: Send + Sync {
    fn validate(&self, method: &str, params: Value) -> Result<Value, String>;
}

impl<F> ParamsValidator for F
where
    F: Fn(&str, Value) -> Result<Value, String> + Send + Sync,
{
    fn validate(&self, method: &str, params: Value) -> Result<Value, String> {
        self(method, params)
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    requests: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    notifications: RwLock<HashMap<String, Arc<dyn NotificationHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_request(&self, method: &str, handler: Arc<dyn RequestHandler>) -> bool {
        self.requests.write().insert(method.to_string(), handler).is_some()
    }

    pub fn insert_notification(&self, method: &str, handler: Arc<dyn NotificationHandler>) -> bool {
        self.notifications
            .write()
            .insert(method.to_string(), handler)
            .is_some()
    }

    pub fn request(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests.read().get(method).cloned()
    }

    pub fn notification(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications.read().get(method).cloned()
    }

    pub fn remove(&self, method: &str) -> bool {
        let a = self.requests.write().remove(method).is_some();
        let b = self.notifications.write().remove(method).is_some();
        a || b
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .requests
            .read()
            .keys()
            .chain(self.notifications.read().keys())
            .cloned()
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }

    /// Drop every handler whose method no longer passes `keep`.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.requests.write().retain(|method, _| {
            let keep = keep(method);
            if !keep {
                removed.push(method.clone());
            }
            keep
        });
        self.notifications.write().retain(|method, _| {
            let keep = keep(method);
            if !keep {
                removed.push(method.clone());
            }
            keep
        });
        removed
    }
}
