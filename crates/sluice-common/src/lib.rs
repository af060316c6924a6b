//! Shared utilities for sluice: configuration, logging, error types.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub use config::{load_json, parse_hex_key};
pub use error::{Error, Result};

/// Initialize tracing.
///
/// Log level is controlled by the `RUST_LOG` environment variable and falls
/// back to `default_level` if not set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
