//! Process-wide log setup.
//!
//! Library code logs through the `log` facade and `tracing` spans. These
//! helpers install a `tracing-subscriber` pipeline and bridge `log` records
//! into it.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::error::{Result, TidelineError};

/// Filter used when neither an explicit filter nor `RUST_LOG` is given.
pub const DEFAULT_FILTER: &str = "info";

/// Installs a human-readable subscriber.
pub fn init(filter: Option<&str>) -> Result<()> {
    let subscriber = Registry::default()
        .with(env_filter(filter)?)
        .with(fmt::layer().with_target(true));
    install(subscriber)
}

/// Installs a subscriber emitting one JSON object per event.
pub fn init_json(filter: Option<&str>) -> Result<()> {
    let subscriber = Registry::default()
        .with(env_filter(filter)?)
        .with(fmt::layer().json().with_current_span(true));
    install(subscriber)
}

fn env_filter(filter: Option<&str>) -> Result<EnvFilter> {
    match filter {
        Some(directives) => EnvFilter::try_new(directives)
            .map_err(|e| TidelineError::Logging(format!("invalid filter '{}': {}", directives, e))),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

fn install<S>(subscriber: S) -> Result<()>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| TidelineError::Logging(e.to_string()))?;
    tracing_log::LogTracer::init().map_err(|e| TidelineError::Logging(e.to_string()))
}
