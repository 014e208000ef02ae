//! provides logging helpers

use std::io;

use tracing::Subscriber;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Directory for the rolling log file copy, read when no CLI flag is given.
pub const LOG_PATH_ENV_VAR: &str = "HARNESS_LOG_PATH";

/// Default filter: `info` unless `RUST_LOG` says otherwise.
pub fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Human readable stderr layer used by every binary.
pub fn get_fmt_layer<S>() -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    layer().with_writer(io::stderr).with_target(true)
}

/// initiate the global tracing subscriber
pub fn init() {
    let fmt_layer = get_fmt_layer().with_filter(env_filter());

    registry().with(fmt_layer).init();
}
