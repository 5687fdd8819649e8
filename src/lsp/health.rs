//! Connection state, activity timestamps and heartbeat liveness.
use crate::lsp::config::HeartbeatConfig;
use crate::lsp::listeners::{Listeners, Subscription};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Edges of the connection state machine. Besides the main cycle a
    /// connection may drop back to `Connecting` while reconnecting, and an
    /// attempt that never connected may go straight to `Disconnecting`.
    pub fn can_move_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Connecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeartbeatStatus {
    pub is_responsive: bool,
    pub last_pong: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    pub last_sent: Option<DateTime<Utc>>,
    pub last_received: Option<DateTime<Utc>>,
    pub heartbeat: Option<HeartbeatStatus>,
    /// Connected and, when a heartbeat is attached, responsive.
    pub is_healthy: bool,
}

/// Side-effect run on every heartbeat tick (typically sending a ping).
pub type PingFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct HeartbeatShared {
    window: Duration,
    started: Instant,
    last_pong: Mutex<Option<(Instant, DateTime<Utc>)>>,
    responsive: AtomicBool,
    status_changes: Listeners<HeartbeatStatus>,
}

impl HeartbeatShared {
    fn evaluate(&self) -> bool {
        match *self.last_pong.lock() {
            Some((at, _)) => at.elapsed() <= self.window,
            // Grace period until the first window has passed.
            None => self.started.elapsed() <= self.window,
        }
    }

    fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            is_responsive: self.responsive.load(Ordering::SeqCst),
            last_pong: self.last_pong.lock().map(|(_, at)| at),
        }
    }

    fn update(&self, responsive: bool) {
        if self.responsive.swap(responsive, Ordering::SeqCst) != responsive {
            if responsive {
                tracing::info!("heartbeat: peer responsive again");
            } else {
                tracing::warn!(window_ms = self.window.as_millis() as u64, "heartbeat: no traffic within window");
            }
            self.status_changes.emit(&self.status());
        }
    }
}

/// Periodically runs the ping side-effect and tracks whether any traffic
/// arrived within the responsiveness window.
pub struct HeartbeatMonitor {
    shared: Arc<HeartbeatShared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn start(config: &HeartbeatConfig, ping: PingFn) -> Self {
        let shared = Arc::new(HeartbeatShared {
            window: config.responsiveness_window,
            started: Instant::now(),
            last_pong: Mutex::new(None),
            responsive: AtomicBool::new(true),
            status_changes: Listeners::new("heartbeat.status"),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat_loop(
            Arc::clone(&shared),
            config.tick_interval(),
            ping,
            cancel.clone(),
        ));
        HeartbeatMonitor {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn record_pong(&self) {
        *self.shared.last_pong.lock() = Some((Instant::now(), Utc::now()));
        self.shared.update(true);
    }

    pub fn status(&self) -> HeartbeatStatus {
        self.shared.status()
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&HeartbeatStatus) + Send + Sync + 'static,
    {
        self.shared.status_changes.subscribe(callback)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn heartbeat_loop(shared: Arc<HeartbeatShared>, period: Duration, ping: PingFn, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("heartbeat: stopping");
                break;
            }
            _ = interval.tick() => {}
        }
        ping().await;
        shared.update(shared.evaluate());
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    state: ConnectionState,
    last_sent: Option<DateTime<Utc>>,
    last_received: Option<DateTime<Utc>>,
}

struct HealthInner {
    record: Mutex<HealthRecord>,
    heartbeat: Mutex<Option<Arc<HeartbeatMonitor>>>,
    state_changes: Listeners<StateChange>,
    snapshots: Listeners<HealthSnapshot>,
}

impl HealthInner {
    fn snapshot(&self) -> HealthSnapshot {
        let record = self.record.lock().clone();
        let heartbeat = self.heartbeat.lock().as_ref().map(|monitor| monitor.status());
        HealthSnapshot {
            state: record.state,
            last_sent: record.last_sent,
            last_received: record.last_received,
            is_healthy: record.state == ConnectionState::Connected
                && heartbeat.map_or(true, |status| status.is_responsive),
            heartbeat,
        }
    }
}

/// One per peer; the only writer of its connection's health record.
#[derive(Clone)]
pub struct HealthTracker {
    inner: Arc<HealthInner>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        HealthTracker {
            inner: Arc::new(HealthInner {
                record: Mutex::new(HealthRecord {
                    state: ConnectionState::Disconnected,
                    last_sent: None,
                    last_received: None,
                }),
                heartbeat: Mutex::new(None),
                state_changes: Listeners::new("health.state"),
                snapshots: Listeners::new("health.snapshot"),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.record.lock().state
    }

    /// Returns `false` (and emits nothing) when already in `next` or when
    /// the state machine has no edge to it.
    pub fn set_state(&self, next: ConnectionState, reason: Option<&str>) -> bool {
        let change = {
            let mut record = self.inner.record.lock();
            if record.state == next {
                return false;
            }
            if !record.state.can_move_to(next) {
                tracing::debug!(from = %record.state, to = %next, reason = ?reason, "ignoring connection state change");
                return false;
            }
            let previous = record.state;
            record.state = next;
            StateChange {
                previous,
                current: next,
                timestamp: Utc::now(),
                reason: reason.map(str::to_string),
            }
        };
        tracing::debug!(from = %change.previous, to = %change.current, reason = ?change.reason, "connection state");
        self.inner.state_changes.emit(&change);
        self.inner.snapshots.emit(&self.inner.snapshot());
        true
    }

    pub fn record_sent(&self) {
        self.inner.record.lock().last_sent = Some(Utc::now());
    }

    /// Any inbound traffic also counts as a heartbeat pong.
    pub fn record_received(&self) {
        self.inner.record.lock().last_received = Some(Utc::now());
        let monitor = self.inner.heartbeat.lock().clone();
        if let Some(monitor) = monitor {
            monitor.record_pong();
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.snapshot()
    }

    pub fn is_healthy(&self) -> bool {
        self.snapshot().is_healthy
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.state_changes.subscribe(callback)
    }

    pub fn on_health_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&HealthSnapshot) + Send + Sync + 'static,
    {
        self.inner.snapshots.subscribe(callback)
    }

    /// Replace any running heartbeat monitor with a new one.
    pub fn attach_heartbeat(&self, config: &HeartbeatConfig, ping: PingFn) {
        let monitor = Arc::new(HeartbeatMonitor::start(config, ping));
        let weak: Weak<HealthInner> = Arc::downgrade(&self.inner);
        let _ = monitor.on_status_change(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.snapshots.emit(&inner.snapshot());
            }
        });
        if let Some(previous) = self.inner.heartbeat.lock().replace(monitor) {
            previous.stop();
        }
    }

    pub fn detach_heartbeat(&self) {
        if let Some(monitor) = self.inner.heartbeat.lock().take() {
            monitor.stop();
        }
    }

    pub fn heartbeat(&self) -> Option<HeartbeatStatus> {
        self.inner.heartbeat.lock().as_ref().map(|monitor| monitor.status())
    }
}
