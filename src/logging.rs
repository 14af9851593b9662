//! Tracing setup.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `strainsync=debug`.
pub const LOG_ENV: &str = "STRAINSYNC_LOG";

const LOG_FILE_PREFIX: &str = "strainsync.log";

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber, writing to a daily log file in `log_dir`.
///
/// Falls back to stderr when the directory can't be created. The returned
/// guard flushes the file writer on drop and must be held for the lifetime
/// of the process.
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
  if std::fs::create_dir_all(log_dir).is_err() {
    init_stderr();
    return None;
  }

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let installed = tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(writer)
    .with_ansi(false)
    .try_init();

  // Already installed (tests, embedding); keep whatever is there
  installed.ok().map(|()| guard)
}

/// Install the global subscriber writing to stderr.
pub fn init_stderr() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter())
    .with_writer(std::io::stderr)
    .try_init();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_init_creates_log_dir() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");

    let _guard = init(&log_dir);

    assert!(log_dir.is_dir());
    // A second install must not panic
    assert!(init(&log_dir).is_none());
  }
}
