//! Process-wide tracing subscriber. Library code only emits events.

use tracing_subscriber::{fmt, EnvFilter};

/// `1` switches stderr output to one JSON object per event.
pub const ENV_LOG_JSON: &str = "KEYWARDEN_LOG_JSON";

/// Installs the subscriber once; later calls are no-ops. Filter comes from
/// `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let use_json = std::env::var(ENV_LOG_JSON)
        .map(|value| value == "1")
        .unwrap_or(false);

    if use_json {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
