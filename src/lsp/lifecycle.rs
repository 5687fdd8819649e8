//! Handshake state machine shared by client and server peers.
use crate::lsp::error::ProtocolError;
use crate::lsp::listeners::{Listeners, Subscription};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Created,
    /// `initialize` sent (client) or received (server); awaiting completion.
    Initializing,
    Initialized,
    ShuttingDown,
    Shutdown,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initializing => write!(f, "initializing"),
            Self::Initialized => write!(f, "initialized"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl PeerState {
    fn can_move_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Initialized)
                | (Initializing, Created)
                | (Initialized, ShuttingDown)
                | (Shutdown, Created)
                | (_, Shutdown)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: PeerState,
    pub current: PeerState,
}

pub struct Lifecycle {
    state: ArcSwap<PeerState>,
    // Serializes check-then-store; reads stay lock-free.
    transition_lock: Mutex<()>,
    transitions: Listeners<Transition>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle {
            state: ArcSwap::from_pointee(PeerState::Created),
            transition_lock: Mutex::new(()),
            transitions: Listeners::new("lifecycle.transition"),
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PeerState {
        **self.state.load()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == PeerState::Initialized
    }

    /// Move to `next` if the current state allows it. Re-entering the current
    /// state is a no-op.
    pub fn transition(&self, next: PeerState) -> Result<PeerState, ProtocolError> {
        let guard = self.transition_lock.lock();
        let previous = self.state();
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_move_to(next) {
            return Err(ProtocolError::InvalidState(format!("{} -> {}", previous, next)));
        }
        self.state.store(Arc::new(next));
        drop(guard);
        tracing::debug!(from = %previous, to = %next, "lifecycle transition");
        self.transitions.emit(&Transition {
            previous,
            current: next,
        });
        Ok(previous)
    }

    /// Transition only when currently in `expected`.
    pub fn advance(&self, expected: PeerState, next: PeerState) -> Result<(), ProtocolError> {
        let guard = self.transition_lock.lock();
        let previous = self.state();
        if previous != expected || !previous.can_move_to(next) {
            return Err(ProtocolError::InvalidState(format!(
                "expected {} to move to {}, found {}",
                expected, next, previous
            )));
        }
        self.state.store(Arc::new(next));
        drop(guard);
        tracing::debug!(from = %previous, to = %next, "lifecycle transition");
        self.transitions.emit(&Transition {
            previous,
            current: next,
        });
        Ok(())
    }

    pub fn on_transition<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.transitions.subscribe(callback)
    }
}
