use tracing_subscriber::{prelude::*, util::TryInitError, EnvFilter, Registry};

/// Initialize tracing
///
/// Filtering follows `RUST_LOG` and falls back to `info`. `json` switches the
/// fmt layer to structured output for log shippers.
pub fn init(json: bool) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let collector = Registry::default().with(env_filter);

    if json {
        collector.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        collector.with(tracing_subscriber::fmt::layer().compact()).try_init()
    }
}
