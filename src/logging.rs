use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn default_directives(level: LevelFilter) -> String {
  match level {
    LevelFilter::OFF => "off".to_string(),
    level => format!("warn,offline_store={}", level.to_string().to_lowercase()),
  }
}

/// Initializes logging.
///
/// `RUST_LOG` wins over `level`. Logs go to stderr, and additionally to
/// `log_file` through a non-blocking writer; keep the returned guard alive
/// until exit so buffered lines are flushed.
pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(true);

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_directives() {
    assert_eq!(default_directives(LevelFilter::OFF), "off");
    assert_eq!(
      default_directives(LevelFilter::DEBUG),
      "warn,offline_store=debug"
    );
  }
}
