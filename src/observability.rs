//! Logging setup for binaries
//!
//! The library only emits `tracing` events; installing a subscriber is
//! left to the process. Settings come from the environment:
//! - `RUST_LOG`: filter directives (default: info)
//! - `BUCKET_WATCH_LOG_FORMAT`: `plain` (default) or `json`

use tracing_subscriber::EnvFilter;

/// Output format of the fmt subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    /// Read `BUCKET_WATCH_LOG_FORMAT`, falling back to plain
    pub fn from_env() -> Self {
        std::env::var("BUCKET_WATCH_LOG_FORMAT")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}
