//! Log output for the driver.
//!
//! `RUST_LOG` wins over the configured level when set. The first installed
//! global subscriber wins, so applications that set up their own tracing
//! keep it.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogLevel};

/// Installs a `fmt` subscriber for the driver crates.
///
/// Returns `false` when logging is off or another subscriber is installed.
pub fn init(config: &LogConfig) -> bool {
    if config.level == LogLevel::Off {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(config.level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .with(filter)
        .try_init()
        .is_ok()
}

fn directives(level: LogLevel) -> String {
    let level = level.as_str();
    format!("ckv_client={level},ckv_node={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_installs_nothing() {
        assert!(!init(&LogConfig::default()));
    }

    #[test]
    fn directives_cover_driver_crates() {
        assert_eq!(directives(LogLevel::Debug), "ckv_client=debug,ckv_node=debug");
    }
}
