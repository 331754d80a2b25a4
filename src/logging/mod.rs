//! Logging setup.
//!
//! Built on `tracing`: an uptime timer (seconds since boot), file and line
//! recording, an `EnvFilter` seeded from the configured minimum level, and a
//! token-bucket rate limit applied as a per-layer filter so a fault loop
//! cannot flood the console. Components log with the `tracing` macros
//! directly; `Critical` maps onto ERROR.

mod rate_limit;

pub use rate_limit::RateLimitFilter;

use std::fmt::Write as _;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggerConfig;
use crate::error::{RelayError, RelayResult};
use crate::stats::Stats;
use crate::time::SharedClock;

/// Runtime minimum log level.
///
/// Compile-time filtering is delegated to `tracing`'s
/// `release_max_level_*` features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Highest severity; rendered through the ERROR level.
    Critical,
}

impl LogLevel {
    /// Filter directive for the subscriber.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// Line prefix: seconds since boot and the free-heap gauge, so every line
/// carries the memory context it was emitted under.
struct UptimeWithHeap {
    epoch: Instant,
    stats: Stats,
}

impl FormatTime for UptimeWithHeap {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let elapsed = self.epoch.elapsed();
        write!(
            w,
            "{:6}.{:03}s [heap {:>8}]",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            self.stats.snapshot().heap_free_current
        )
    }
}

/// Initialize the global subscriber from the logger configuration.
///
/// `RUST_LOG` overrides the configured minimum level when set. Returns an
/// error if a subscriber is already installed.
pub fn init_logging(cfg: &LoggerConfig, clock: SharedClock, stats: &Stats) -> RelayResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.min_level.directive()));

    let fmt_layer = fmt::layer()
        .with_timer(UptimeWithHeap {
            epoch: Instant::now(),
            stats: stats.clone(),
        })
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    let rate_limit = RateLimitFilter::new(cfg.max_lines_per_sec, cfg.burst_max, clock, stats.clone());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer.with_filter(rate_limit))
        .try_init()
        .map_err(|e| RelayError::Logging(e.to_string()))?;

    tracing::info!(
        min_level = cfg.min_level.directive(),
        max_lines_per_sec = cfg.max_lines_per_sec,
        burst_max = cfg.burst_max,
        "logging initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directives() {
        assert_eq!(LogLevel::Debug.directive(), "debug");
        assert_eq!(LogLevel::Info.directive(), "info");
        assert_eq!(LogLevel::Critical.directive(), "error");
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Critical);
    }

    #[test]
    fn test_level_deserializes_lowercase() {
        let level: LogLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(level, LogLevel::Warn);

        let level: LogLevel = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(level, LogLevel::Critical);
    }
}
