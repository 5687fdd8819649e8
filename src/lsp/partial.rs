//! Streams partial results delivered through `$/progress` to their request.
use crate::lsp::types::RequestId;
use lsp_types::{NumberOrString, ProgressToken};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Params field a request uses to opt into partial results.
pub const PARTIAL_RESULT_TOKEN_FIELD: &str = "partialResultToken";

type OnPartial = Arc<dyn Fn(&Value) + Send + Sync>;

struct PartialEntry {
    buffer: Vec<Value>,
    on_partial: OnPartial,
}

#[derive(Default)]
pub struct PartialResultCollector {
    entries: Mutex<HashMap<RequestId, PartialEntry>>,
    next_token: AtomicU64,
}

fn key(token: &ProgressToken) -> RequestId {
    RequestId::from(token.clone())
}

impl PartialResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token unique within this collector.
    pub fn next_token(&self) -> ProgressToken {
        let n = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        NumberOrString::String(format!("partial-{}", n))
    }

    pub fn start<F>(&self, token: &ProgressToken, on_partial: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let previous = self.entries.lock().insert(
            key(token),
            PartialEntry {
                buffer: Vec::new(),
                on_partial: Arc::new(on_partial),
            },
        );
        if previous.is_some() {
            tracing::warn!(token = ?token, "partial result token reused; previous stream dropped");
        }
    }

    /// Append `value` and hand it to the entry's callback. Returns `false` when
    /// no entry is active for `token`.
    pub fn push(&self, token: &ProgressToken, value: Value) -> bool {
        let on_partial = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key(token)) else {
                return false;
            };
            entry.buffer.push(value.clone());
            Arc::clone(&entry.on_partial)
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_partial(&value))).is_err() {
            tracing::error!(token = ?token, "partial result callback panicked");
        }
        true
    }

    /// Tear the entry down without further delivery. Values already handed to
    /// the callback are not retracted.
    pub fn abort(&self, token: &ProgressToken) -> Option<Vec<Value>> {
        self.entries.lock().remove(&key(token)).map(|entry| entry.buffer)
    }

    /// Same as [`abort`](Self::abort); called once the owning request settled.
    pub fn finish(&self, token: &ProgressToken) -> Option<Vec<Value>> {
        self.abort(token)
    }

    pub fn is_active(&self, token: &ProgressToken) -> bool {
        self.entries.lock().contains_key(&key(token))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
