use std::io;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the diagnostic subscriber.  Diagnostics go to stderr so they never mix with the report;
/// RUST_LOG wins if set, otherwise only warnings are shown unless `verbose`.
pub fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .with_target(false)
        .init();
}
