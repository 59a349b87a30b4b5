//! Operator diagnostics for chaosctl.
//!
//! Controller operations open a span carrying the experiment id; the AWS and
//! kubectl adapters log each CLI invocation at `debug` and every retried or
//! abandoned step at `warn`. All of it goes to stderr and is filtered by
//! `RUST_LOG`.
//!
//! What an operator must be able to audit later is never a log line: the
//! outcome of each lifecycle step is a note on the experiment record under
//! `.chaos/experiments/`, and each applied transition is appended to
//! `.chaos/journal/<id>.jsonl`, whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Directive used when `RUST_LOG` is unset, blank, or unparsable.
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the stderr subscriber. Call once, before the first command runs.
///
/// ```bash
/// RUST_LOG=chaosctl::lifecycle=debug chaosctl execute exp-cache-failover
/// ```
pub fn init() {
    let raw = std::env::var("RUST_LOG").ok();
    tracing_subscriber::registry()
        .with(env_filter(raw.as_deref()))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

fn env_filter(raw: Option<&str>) -> EnvFilter {
    raw.filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}
