//! Tracing setup for hosts embedding the aggregator.
//!
//! `RUST_LOG` wins over the configured level so a single run can be made
//! more verbose without touching the config file.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Build the log filter: `RUST_LOG` if set and parsable, else the configured
/// level for every crate.
pub fn build_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install a global fmt subscriber. Fails instead of panicking when a
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(build_filter(config))
        .with(fmt_layer)
        .try_init()?;

    tracing::debug!(level = %config.level, "tracing initialized");
    Ok(())
}
