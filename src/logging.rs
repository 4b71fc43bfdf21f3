//! Tracing setup shared by both binaries
//!
//! Logs always go to stderr: the worker's stdout carries protocol lines.

use crate::config::LogFormat;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins over the configured level
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)))
}

fn default_directive(level: &str) -> String {
    format!("storyshot={}", level.trim().to_ascii_lowercase())
}

/// Install the global subscriber
pub fn init(level: &str, format: LogFormat) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(level));

    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
}
