use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {source}")]
    File { path: String, source: io::Error },
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("logger already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Operator-facing lines on stderr, plus a timestamped copy appended to
/// `log_file`.
pub fn init_logging(filter: &str, log_file: &Path) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(filter)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|source| LoggingError::File {
            path: log_file.display().to_string(),
            source,
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .without_time()
                .compact(),
        )
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;

    Ok(())
}
