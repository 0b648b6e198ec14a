//! Tracing setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

/// Initialize tracing with console output.
///
/// The filter comes from `RUST_LOG` (default `meshdrop=info`). Set
/// `MESHDROP_LOG_FORMAT=json` for one JSON object per event.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "meshdrop=info,meshdrop_sim=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match LogFormat::from_env() {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
