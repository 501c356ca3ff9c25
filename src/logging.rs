//! Tracing setup for the service and CLI.
//!
//! `RUST_LOG` wins over the configured level. Output goes to stderr (text or
//! JSON); when a log directory is configured a daily rolling file receives
//! the same events in JSON.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Install the global subscriber. Hold the returned guard for the lifetime of
/// the process so buffered file output is flushed on exit.
pub fn init(config: &LoggingSection, verbose: bool) -> Option<WorkerGuard> {
    let default_level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .boxed(),
    };

    let (file_layer, guard) = match config.dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sentinel.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
