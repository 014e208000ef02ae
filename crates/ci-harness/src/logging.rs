//! Driver logging: stderr plus an optional daily rolling file.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const LOG_FILE_PREFIX: &str = "ci-harness.log";

/// Initiate the global tracing subscriber. Keep the guard alive until exit so
/// the file writer flushes.
pub(crate) fn init(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let fmt_layer = utils::logging::get_fmt_layer().with_filter(utils::logging::env_filter());

    let Some(log_dir) = log_dir else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(7)
        .build(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(utils::logging::env_filter());

    registry().with(fmt_layer).with(file_layer).init();
    Ok(Some(file_guard))
}
