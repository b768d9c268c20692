//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging. Pretty output in
//! debug builds, JSON lines with the current span in release builds.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber at `info`, before any config is loaded.
pub fn init_telemetry() {
    init_telemetry_with_level("info");
}

/// Initialize the tracing subscriber with the given log level.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter.
/// Only the first call installs a subscriber; later calls are ignored.
pub fn init_telemetry_with_level(log_level: &str) {
    let default_filter = format!(
        "{level},slape_engine={level},tower_http={level}",
        level = log_level
    );

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

/// Pick the effective log level: the `--log` flag wins over the config file.
pub fn effective_level<'a>(cli_level: Option<&'a str>, config_level: &'a str) -> &'a str {
    cli_level.unwrap_or(config_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_wins() {
        assert_eq!(effective_level(Some("debug"), "info"), "debug");
        assert_eq!(effective_level(None, "warn"), "warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_telemetry_with_level("info");
        init_telemetry_with_level("debug");
    }
}
