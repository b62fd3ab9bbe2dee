use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the file writer flushing until dropped
pub struct LogGuard {
    _file_appender_guard: WorkerGuard,
}

/** create a non blocking tracing file appender, one file per program in datadir */
pub fn setup_file_appender<P: AsRef<Path>>(datadir: P, who: &str) -> (NonBlocking, WorkerGuard) {
    let file_appender = rolling::never(datadir.as_ref(), format!("{}.log", who));
    tracing_appender::non_blocking(file_appender)
}

/** create a RUST_LOG env based log filter with the given default level */
pub fn env_filter(level: &str) -> Result<EnvFilter> {
    let level: LevelFilter = level.parse().with_context(|| format!("bad log level {}", level))?;
    Ok(EnvFilter::builder().with_default_directive(level.into()).from_env_lossy())
}

/**
 * Initialize tracing-subscriber with an env filter.
 * Console output goes to stderr, so it does not mix with command output.
 * A second fmt layer writes to a log file in datadir.
 * Records from the `log` facade are forwarded to the subscriber.
 */
pub fn init_tracing_subscriber<P: AsRef<Path>>(
    datadir: P,
    who: &str,
    level: &str,
) -> Result<LogGuard> {
    let datadir = datadir.as_ref();
    fs::create_dir_all(datadir)
        .with_context(|| format!("could not create data directory {}", datadir.display()))?;
    let (file_writer, file_guard) = setup_file_appender(datadir, who);

    let console_layer = fmt::layer().with_writer(std::io::stderr);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(env_filter(level)?)
        .try_init()
        .context("could not install the tracing subscriber")?;
    Ok(LogGuard { _file_appender_guard: file_guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_filter_test() {
        assert!(env_filter("debug").is_ok());
        assert!(env_filter("off").is_ok());
        assert!(env_filter("chatty").is_err());
    }

    #[test]
    fn setup_file_appender_test() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (file_writer, _file_guard) = setup_file_appender(dir.path(), "test");
            let subscriber = tracing_subscriber::registry()
                .with(fmt::layer().with_writer(file_writer).with_ansi(false));
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!("refreshed channels");
            });
        }
        let contents = fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(contents.contains("refreshed channels"));
    }
}
