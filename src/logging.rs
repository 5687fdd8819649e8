use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Logs go to stderr since stdout may be the
/// stdio transport.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
