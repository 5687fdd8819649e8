//! Server role: waits for the client to open the handshake.
use crate::lsp::config::PeerConfig;
use crate::lsp::error::RpcError;
use crate::lsp::lifecycle::PeerState;
use crate::lsp::peer::{Peer, Role};
use crate::lsp::transport::Transport;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Clone)]
pub struct Server {
    peer: Peer,
}

impl Deref for Server {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Server {
    pub fn new(config: PeerConfig) -> Self {
        Server {
            peer: Peer::new(Role::Server, config),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Start serving on `transport`. `initialize`, `shutdown` and `exit` are
    /// answered by the runtime; everything else goes to registered handlers.
    pub async fn listen(&self, transport: Arc<dyn Transport>) -> Result<(), RpcError> {
        let lifecycle = &self.peer.inner.lifecycle;
        if lifecycle.state() == PeerState::Shutdown {
            lifecycle.transition(PeerState::Created)?;
        }
        self.peer.attach(transport).await?;
        tracing::info!(transport = %self.peer.transport_label(), "server listening");
        Ok(())
    }

    /// Serve until the connection ends (`exit`, transport close or `close`).
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<(), RpcError> {
        self.listen(transport).await?;
        self.peer.closed().await;
        Ok(())
    }
}
