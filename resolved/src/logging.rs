use tracing_subscriber::EnvFilter;

use crate::settings::{Env, LogLevel, Settings};

/// Sets up the global `tracing` subscriber. `env=dev` gets a compact,
/// human-readable formatter; `env=prod` gets newline-delimited JSON,
/// suitable for shipping to a log aggregator. `RESOLVED_LOG`
/// overrides the filter derived from `log_level` the same way
/// `RUST_LOG` would, for ad-hoc debugging without changing
/// `RESOLVED_LOG_LEVEL`.
pub fn init(settings: &Settings) {
    let filter = EnvFilter::try_from_env("RESOLVED_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_level_directive(settings.log_level)));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match settings.env {
        Env::Dev => subscriber.compact().init(),
        Env::Prod => subscriber.json().init(),
    }
}

fn log_level_directive(level: LogLevel) -> String {
    level.as_str().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_matches_level() {
        assert_eq!(log_level_directive(LogLevel::Debug), "debug");
        assert_eq!(log_level_directive(LogLevel::Warn), "warn");
    }
}
