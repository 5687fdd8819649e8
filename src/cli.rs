use clap::Parser;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Target {
    /// Language server spawned as a child process, spoken to over stdio.
    Process { command: String, args: Vec<String> },
    WebSocket { url: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub target: Target,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub timeout: Option<Duration>,
    pub strict: bool,
    pub root_uri: Option<lsp_types::Url>,
}

#[derive(Parser, Debug)]
#[command(name = "lsp-peer")]
#[command(about = "Connect to a language server, run the handshake and optionally call one method", long_about = None)]
pub struct Cli {
    /// Server executable followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, conflicts_with = "ws")]
    server: Vec<String>,
    /// Connect to a WebSocket endpoint instead of spawning a process.
    #[arg(long)]
    ws: Option<String>,
    /// Method to call once initialized.
    #[arg(long)]
    pub method: Option<String>,
    /// JSON params for `--method`.
    #[arg(long, requires = "method")]
    pub params: Option<String>,
    /// Per-request timeout; 0 waits indefinitely.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Abort calls the server did not declare a capability for.
    #[arg(long)]
    pub strict: bool,
    /// Workspace root sent as rootUri; defaults to the current directory.
    #[arg(long)]
    pub root: Option<String>,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn into_config(self) -> anyhow::Result<Config> {
        let target = match (self.ws, self.server.split_first()) {
            (Some(url), _) => Target::WebSocket { url },
            (None, Some((command, args))) => Target::Process {
                command: command.clone(),
                args: args.to_vec(),
            },
            (None, None) => anyhow::bail!("give a server command or --ws <url>"),
        };
        let params: Option<Value> = self
            .params
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {}", e))?;
        let root = match self.root {
            Some(root) => std::path::PathBuf::from(root),
            None => std::env::current_dir()?,
        };
        let root_uri = std::fs::canonicalize(&root)
            .ok()
            .and_then(|path| lsp_types::Url::from_directory_path(path).ok());

        Ok(Config {
            target,
            method: self.method,
            params,
            timeout: self.timeout_ms.map(Duration::from_millis),
            strict: self.strict,
            root_uri,
        })
    }
}
