//! Matches responses to outstanding requests by id.
use crate::lsp::error::{CorrelationError, RpcError};
use crate::lsp::types::RequestId;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type Settlement = Result<Value, RpcError>;

struct PendingRequest {
    method: String,
    created_at: Instant,
    sender: oneshot::Sender<Settlement>,
    timeout: Option<JoinHandle<()>>,
}

struct CorrelatorInner {
    pending: DashMap<RequestId, PendingRequest>,
    next_id: AtomicI64,
}

impl CorrelatorInner {
    fn settle(&self, id: &RequestId, outcome: Settlement, from_timer: bool) -> bool {
        let Some((_, entry)) = self.pending.remove(id) else {
            return false;
        };
        if !from_timer {
            if let Some(timer) = entry.timeout {
                timer.abort();
            }
        }
        tracing::trace!(
            id = %id,
            method = %entry.method,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "request settled"
        );
        // The receiver may already be gone (caller dropped the future).
        let _ = entry.sender.send(outcome);
        true
    }
}

/// Pending-request table shared by a peer's send path and its dispatch loop.
///
/// Each id is settled at most once; later `resolve`/`reject` calls for the same
/// id return `false` and have no effect.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            inner: Arc::new(CorrelatorInner {
                pending: DashMap::new(),
                next_id: AtomicI64::new(1),
            }),
        }
    }

    /// Allocate a fresh id and the future its settlement will be delivered to.
    ///
    /// With a `timeout`, an internal timer rejects the entry with
    /// [`CorrelationError::Timeout`] unless it settles first. Must be called
    /// from within a tokio runtime when a timeout is given.
    pub fn create(&self, method: &str, timeout: Option<Duration>) -> (RequestId, PendingResponse) {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = oneshot::channel();
        self.inner.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                created_at: Instant::now(),
                sender,
                timeout: None,
            },
        );

        if let Some(after) = timeout {
            let weak: Weak<CorrelatorInner> = Arc::downgrade(&self.inner);
            let timer_id = id.clone();
            let method = method.to_string();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(inner) = weak.upgrade() {
                    let error = CorrelationError::Timeout {
                        id: timer_id.clone(),
                        method: method.clone(),
                        after,
                    };
                    if inner.settle(&timer_id, Err(error.into()), true) {
                        tracing::debug!(id = %timer_id, method = %method, after_ms = after.as_millis() as u64, "request timed out");
                    }
                }
            });
            match self.inner.pending.get_mut(&id) {
                Some(mut entry) => entry.timeout = Some(timer),
                None => timer.abort(),
            }
        }

        (id.clone(), PendingResponse { id, receiver })
    }

    pub fn resolve(&self, id: &RequestId, value: Value) -> bool {
        self.inner.settle(id, Ok(value), false)
    }

    pub fn reject(&self, id: &RequestId, error: impl Into<RpcError>) -> bool {
        self.inner.settle(id, Err(error.into()), false)
    }

    /// Method of a still-pending request, for diagnostics.
    pub fn get_metadata(&self, id: &RequestId) -> Option<String> {
        self.inner.pending.get(id).map(|entry| entry.method.clone())
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.pending.contains_key(id)
    }

    /// Reject every pending entry with `error`. Returns how many were rejected.
    pub fn clear(&self, error: impl Into<RpcError>) -> usize {
        let error = error.into();
        let ids: Vec<RequestId> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if self.inner.settle(&id, Err(error.clone()), false) {
                rejected += 1;
            }
        }
        if rejected > 0 {
            tracing::debug!(rejected, error = %error, "cleared pending requests");
        }
        rejected
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.inner.pending.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.pending.is_empty()
    }
}

/// Resolves with the settlement of one request.
///
/// Dropping it does not remove the pending entry; a later settlement is
/// simply not observed.
pub struct PendingResponse {
    id: RequestId,
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(settlement)) => Poll::Ready(settlement),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CorrelationError::ConnectionClosed.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_value_once() {
        let correlator = Correlator::new();
        let (id, pending) = correlator.create("textDocument/hover", None);
        assert_eq!(correlator.get_metadata(&id).as_deref(), Some("textDocument/hover"));

        assert!(correlator.resolve(&id, json!({"contents": "doc"})));
        assert!(!correlator.resolve(&id, json!(null)));
        assert!(!correlator.reject(&id, CorrelationError::ConnectionClosed));

        assert_eq!(pending.await.unwrap(), json!({"contents": "doc"}));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_fresh() {
        let correlator = Correlator::new();
        let (a, _pa) = correlator.create("a", None);
        let (b, _pb) = correlator.create("b", None);
        correlator.resolve(&a, json!(1));
        let (c, _pc) = correlator.create("c", None);
        assert_eq!(a, RequestId::Number(1));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[tokio::test]
    async fn test_timeout_rejects_and_removes() {
        let correlator = Correlator::new();
        let started = Instant::now();
        let (id, pending) = correlator.create("slow", Some(Duration::from_millis(50)));

        let err = pending.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!correlator.contains(&id));
        assert!(!correlator.resolve(&id, json!(1)));
    }

    #[tokio::test]
    async fn test_response_before_timeout_wins() {
        let correlator = Correlator::new();
        let (id, pending) = correlator.create("fast", Some(Duration::from_millis(30)));
        correlator.resolve(&id, json!("done"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pending.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_clear_rejects_everything_pending() {
        let correlator = Correlator::new();
        let (_a, pa) = correlator.create("a", None);
        let (b, pb) = correlator.create("b", None);
        correlator.resolve(&b, json!(true));

        assert_eq!(correlator.clear(CorrelationError::ConnectionClosed), 1);
        assert_eq!(
            pa.await.unwrap_err(),
            RpcError::Correlation(CorrelationError::ConnectionClosed)
        );
        assert_eq!(pb.await.unwrap(), json!(true));
    }
}
