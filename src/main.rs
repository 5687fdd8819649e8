mod app;
mod cli;

use cli::Cli;
use lsp_peer::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = Cli::from_args().into_config()?;
    app::run(config).await
}
