//! Structured console logging: a plain `tracing-subscriber` `fmt` layer
//! gated by `RUST_LOG` (default `info`). This sits alongside, not instead
//! of, the CSV event log in `observability::event_log`: that log is the
//! machine-readable artifact, this is the operator-facing console/journal
//! view.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global `tracing` subscriber. Call once at process start,
/// before any listener or supervisor code logs.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_level(true);

    Registry::default().with(filter).with(fmt_layer).init();
}
