//! Diagnostic tracing for `infractl`.
//!
//! Everything goes to stderr so stdout stays free for command output (plan
//! summaries, cached state, the bootstrap signal).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `info`. Compact format on stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=infra=debug infractl destroy --sanity-check
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
