//! Tracing subscriber setup.
//!
//! Library code logs through `log`; those records are bridged into the
//! tracing subscriber so both end up in one stream.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use flagreplica::config::{LogFormat, LoggingConfig};

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(
    logging: &LoggingConfig,
    level_override: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let level = level_override.unwrap_or(&logging.level);
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let registry = Registry::default().with(filter);
    match logging.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))?
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        )?,
    }

    tracing_log::LogTracer::init()?;
    Ok(())
}
