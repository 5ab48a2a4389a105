//! Diagnostic tracing on stderr.
//!
//! This is for people debugging skillrun itself. What a run did is recorded
//! separately in the run directory (`events.jsonl`, the LLM transcript and
//! artifacts), and that record does not depend on `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber: `RUST_LOG` filter (default `warn`), compact
/// lines on stderr so stdout stays clean for run output.
///
/// ```bash
/// RUST_LOG=skillrun::scheduler=debug skillrun run "inventory files"
/// ```
///
/// A second call is a no-op.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .try_init();
}
