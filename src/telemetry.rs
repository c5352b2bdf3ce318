use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize the global tracing subscriber: an `EnvFilter` driven by
/// `RUST_LOG` (defaulting to `info`), formatted as JSON when `LOG_FORMAT=json`
/// and as compact human-readable text otherwise.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// A fresh identifier for one reconciliation cycle, recorded onto the
/// current span so every log line emitted during a cycle can be
/// correlated back to it.
pub fn get_trace_id() -> String {
    Uuid::new_v4().to_string()
}
