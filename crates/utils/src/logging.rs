//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Output format of the global subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, derive_more::Display)]
pub enum LogFormat {
    /// human readable lines
    #[default]
    #[display("text")]
    Text,
    /// one JSON object per event
    #[display("json")]
    Json,
}

/// filter honoring `RUST_LOG`, defaulting to `INFO`
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init(format: LogFormat) {
    let env_filter = env_filter();

    match format {
        LogFormat::Text => {
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter);
            registry().with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = layer()
                .json()
                .with_current_span(false)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter);
            registry().with(fmt_layer).init();
        }
    }
}
