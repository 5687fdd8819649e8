//! Client role: drives the handshake and the orderly shutdown.
use crate::lsp::config::PeerConfig;
use crate::lsp::error::RpcError;
use crate::lsp::lifecycle::PeerState;
use crate::lsp::message_creator::{self as mc, methods, InitializeResult};
use crate::lsp::peer::{Peer, RequestOptions, Role};
use crate::lsp::transport::Transport;
use serde_json::json;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

/// How long `disconnect` waits for the server to acknowledge `shutdown`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Client {
    peer: Peer,
}

impl Deref for Client {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Client {
    pub fn new(config: PeerConfig) -> Self {
        Client {
            peer: Peer::new(Role::Client, config),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Attach `transport` and run the `initialize`/`initialized` handshake.
    ///
    /// On failure the transport is closed and the client returns to
    /// `Created`, so `connect` may be retried with a fresh transport.
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<InitializeResult, RpcError> {
        let inner = &self.peer.inner;
        if inner.lifecycle.state() == PeerState::Shutdown {
            inner.lifecycle.transition(PeerState::Created)?;
        }
        inner
            .lifecycle
            .advance(PeerState::Created, PeerState::Initializing)?;

        match self.handshake(transport).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(error = %e, "handshake failed");
                inner.teardown("handshake failed").await;
                inner.forget_remote();
                let _ = inner.lifecycle.transition(PeerState::Created);
                Err(e)
            }
        }
    }

    async fn handshake(&self, transport: Arc<dyn Transport>) -> Result<InitializeResult, RpcError> {
        let inner = &self.peer.inner;
        self.peer.attach(transport).await?;

        let mut params = mc::initialize_params(inner.config());
        params.capabilities = inner.local_capabilities();
        let params = serde_json::to_value(params).map_err(|e| RpcError::handler(e.to_string()))?;
        let reply = self.peer.request(methods::INITIALIZE, Some(params)).await?;
        let result = mc::parse_initialize_result(reply)?;

        inner.set_remote_capabilities(result.capabilities.clone());
        inner.set_remote_info(mc::remote_info(None, result.server_info.as_ref()));
        self.peer.notify(methods::INITIALIZED, Some(json!({}))).await?;
        inner
            .lifecycle
            .advance(PeerState::Initializing, PeerState::Initialized)?;
        tracing::info!(
            server = ?result.server_info.as_ref().map(|info| info.name.as_str()),
            "handshake complete"
        );
        Ok(result)
    }

    /// Send `shutdown` then `exit` and close the transport. Failures on the
    /// way out are logged; the client always ends in `Shutdown`.
    pub async fn disconnect(&self) {
        let inner = &self.peer.inner;
        if inner.lifecycle.state() == PeerState::Initialized {
            if let Err(e) = inner.lifecycle.transition(PeerState::ShuttingDown) {
                tracing::debug!(error = %e, "shutdown raced another transition");
            }
            let options = RequestOptions::new().timeout(SHUTDOWN_TIMEOUT);
            if let Err(e) = self.peer.request_with(methods::SHUTDOWN, None, options).await {
                tracing::warn!(error = %e, "shutdown request failed");
            }
            if let Err(e) = self.peer.notify(methods::EXIT, None).await {
                tracing::debug!(error = %e, "exit notification not sent");
            }
        }
        let _ = inner.lifecycle.transition(PeerState::Shutdown);
        inner.teardown("client disconnected").await;
    }
}
