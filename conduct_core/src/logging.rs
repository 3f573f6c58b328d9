//! Structured logging setup.
//!
//! Library code only emits `tracing` events; binaries and tests decide where
//! they go by calling [`init_logging`] once at startup.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Default filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Installs a global fmt subscriber filtered by `RUST_LOG` or `filter`.
///
/// Safe to call repeatedly; only the first call has an effect, and an
/// already-installed global subscriber is left in place.
///
/// # Example
///
/// ```ignore
/// conduct_core::logging::init_logging(Some("conduct_agent=debug"));
/// ```
pub fn init_logging(filter: Option<&str>) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));

        let subscriber = tracing_subscriber::registry().with(env_filter).with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true),
        );

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already set, keeping it");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging(Some("debug"));
        init_logging(Some("trace"));
        tracing::info!("logging initialised twice without panicking");
    }
}
