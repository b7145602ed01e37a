//! Observability infrastructure: tracing and metrics.
//!
//! Library code only emits `tracing` events and `metrics` samples. Binaries call [`init`]
//! once to install a subscriber; without one, events and samples are dropped.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize logging at `level` unless `RUST_LOG` says otherwise, and describe the core
/// metrics.
///
/// Fails if a global subscriber is already installed or `level` is not a valid filter.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init()?;

    metrics::register_core_metrics();
    tracing::debug!("Observability initialized (level: {})", level);
    Ok(())
}
