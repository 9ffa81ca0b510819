//! Tracing subscriber setup shared by the probe and embedding services.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is unset (e.g. `"hooktunnel_client=info"`).
/// * `log_json` -- emit JSON lines instead of the human-readable format.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    let _ = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}
