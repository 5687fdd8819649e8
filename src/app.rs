use std::sync::Arc;
use std::time::Duration;

use crate::cli::{Config, Target};
use lsp_peer::lsp::{ChannelTransport, Client, PeerConfig, ReconnectPolicy, StreamTransport, Transport};
use serde_json::json;

/// What the demo client advertises; enough for servers to accept it.
fn client_capabilities() -> serde_json::Value {
    json!({
        "workspace": { "applyEdit": false, "configuration": false, "workspaceFolders": false },
        "window": { "workDoneProgress": false },
        "textDocument": {
            "hover": { "contentFormat": ["markdown", "plaintext"] },
            "synchronization": { "didSave": false }
        }
    })
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let mut peer_config = PeerConfig::from_env()
        .with_capabilities(client_capabilities())
        .strict(config.strict);
    if let Some(timeout) = config.timeout {
        let timeout = (timeout > Duration::ZERO).then_some(timeout);
        peer_config = peer_config.with_request_timeout(timeout);
    }
    peer_config.root_uri = config.root_uri.clone();

    let transport: Arc<dyn Transport> = match &config.target {
        Target::Process { command, args } => Arc::new(StreamTransport::spawn(command, args)?),
        Target::WebSocket { url } => Arc::new(ChannelTransport::websocket(url.clone(), ReconnectPolicy::from_env())),
    };
    tracing::info!(transport = transport.label(), "connecting");

    let client = Client::new(peer_config);
    let _errors = client.on_error(|e| tracing::warn!(error = %e, "peer error"));
    let init = client.connect(transport).await?;
    let server = init
        .server_info
        .as_ref()
        .map(|info| format!("{} {}", info.name, info.version.as_deref().unwrap_or("")))
        .unwrap_or_else(|| "unnamed server".to_string());
    println!("Initialized: {}", server.trim_end());

    let outcome = match &config.method {
        Some(method) => client.request(method, config.params.clone()).await,
        None => Ok(init.capabilities.clone()),
    };

    client.disconnect().await;

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
