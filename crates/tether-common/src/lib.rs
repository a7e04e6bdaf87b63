//! Shared utilities for Tether: logging, constant-time helpers, clocks.
//!
//! This crate provides common infrastructure used across all Tether components.

#![forbid(unsafe_code)]

pub mod helpers;
pub mod time;

pub use helpers::{constant_time_eq, key_fingerprint};
pub use time::now_millis;

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Initialize tracing with a specific default level.
///
/// `RUST_LOG` still takes precedence when set.
pub fn init_tracing_with_default(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
