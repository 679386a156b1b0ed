//! Logging setup for DevAuth binaries and tests.
//!
//! Filtering follows `RUST_LOG`; without it everything at `info` and above
//! is emitted. Devices that ship logs to a gateway should use [`init_json`].

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install a human-readable subscriber with target and thread ids.
///
/// Panics if a global subscriber is already set.
///
/// # Example
/// ```no_run
/// use devauth_core::logging;
///
/// logging::init();
/// tracing::info!("Provisioning client started");
/// ```
pub fn init() {
    let layer = fmt::layer().with_target(true).with_thread_ids(true);
    tracing_subscriber::registry().with(env_filter()).with(layer).init();
}

/// Install a subscriber that writes one JSON object per event.
///
/// # Example
/// ```no_run
/// use devauth_core::logging;
///
/// logging::init_json();
/// tracing::info!(backend = "tpm", "HSM system initialized");
/// ```
pub fn init_json() {
    let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
    tracing_subscriber::registry().with(env_filter()).with(layer).init();
}

/// Install a test-writer subscriber; returns `false` if one was already set.
pub fn try_init() -> bool {
    let layer = fmt::layer().with_target(true).with_test_writer();
    tracing_subscriber::registry()
        .with(env_filter())
        .with(layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_builds() {
        let _ = env_filter();
    }

    #[test]
    fn test_try_init_is_repeatable() {
        let _ = try_init();
        assert!(!try_init());
    }
}
