//! Structured logging setup driven by config.
//!
//! Installs a single global `tracing` subscriber with file, line, and level
//! information. Safe to call more than once; only the first call wins.

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::LogConfig;

static INIT: Once = Once::new();

/// Initializes the global subscriber at the configured level.
pub fn init_logging(config: &LogConfig) {
    let level = match config.level.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    };
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_filter(level),
            )
            .init();
    });
}
