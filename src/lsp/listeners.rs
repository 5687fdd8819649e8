//! Ordered listener lists with explicit disposal handles.
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    callback: Callback<T>,
}

struct Inner<T> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

/// Subscribers are invoked in subscription order. A panicking subscriber is
/// logged and skipped; the remaining subscribers still receive the event.
pub struct Listeners<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Listeners {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new(name: &'static str) -> Self {
        Listeners {
            inner: Arc::new(Inner {
                name,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.lock().push(Entry {
            id,
            callback: Arc::new(callback),
        });
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.entries.lock().retain(|entry| entry.id != id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &T) {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let callbacks: Vec<Callback<T>> = self
            .inner
            .entries
            .lock()
            .iter()
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(listeners = self.inner.name, "listener panicked; continuing delivery");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }
}

/// Disposal handle returned by every `on_*` subscription.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// A handle that is not attached to any listener list.
    pub fn detached() -> Self {
        Subscription { remove: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.remove.is_some())
            .finish()
    }
}
