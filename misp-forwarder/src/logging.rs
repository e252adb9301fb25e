use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

const LOG_FILE_PREFIX: &str = "misp-forwarder.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Maps the accepted spellings of a verbosity to a tracing directive.
pub fn normalize_level(level: &str) -> Option<&'static str> {
  match level.trim().to_ascii_lowercase().as_str() {
    "trace" => Some("trace"),
    "debug" => Some("debug"),
    "info" => Some("info"),
    "warn" | "warning" => Some("warn"),
    "error" | "critical" => Some("error"),
    _ => None,
  }
}

/// Stderr logging, plus a daily rolling file when `log_dir` is given.
pub fn init(log_dir: Option<&Path>, level: &str, retention_days: u64) -> anyhow::Result<()> {
  let directive = normalize_level(level).unwrap_or("info");
  let (filter, handle) = reload::Layer::new(EnvFilter::new(directive));
  let _ = FILTER_HANDLE.set(handle);

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(std::io::stderr)
    .with_target(true);

  match log_dir {
    Some(dir) => {
      fs::create_dir_all(dir)?;
      cleanup_old_logs(dir, retention_days)?;

      let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
      let _ = FILE_GUARD.set(guard);

      let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_target(true);

      tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .try_init()?;
    }
  }

  Ok(())
}

/// Swaps the active filter. Unknown levels leave the current one in place.
pub fn set_level(level: &str) {
  let Some(directive) = normalize_level(level) else {
    tracing::warn!(level, "unknown log level; keeping current verbosity");
    return;
  };
  let Some(handle) = FILTER_HANDLE.get() else {
    return;
  };
  match handle.reload(EnvFilter::new(directive)) {
    Ok(()) => tracing::info!(level = directive, "log level applied"),
    Err(e) => tracing::warn!(error = %e, "unable to apply log level"),
  }
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
  if retention_days == 0 {
    return Ok(());
  }

  let cutoff = SystemTime::now()
    .checked_sub(Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)))
    .unwrap_or(SystemTime::UNIX_EPOCH);

  let entries = match fs::read_dir(log_dir) {
    Ok(e) => e,
    Err(_) => return Ok(()),
  };

  for entry in entries.flatten() {
    let path: PathBuf = entry.path();
    if !is_forwarder_log_file(&path) {
      continue;
    }

    let modified = match entry.metadata().and_then(|m| m.modified()) {
      Ok(t) => t,
      Err(_) => continue,
    };

    if modified < cutoff {
      let _ = fs::remove_file(&path);
    }
  }

  Ok(())
}

fn is_forwarder_log_file(path: &Path) -> bool {
  let name = match path.file_name().and_then(|n| n.to_str()) {
    Some(n) => n,
    None => return false,
  };

  name == LOG_FILE_PREFIX || name.starts_with("misp-forwarder.log.")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn level_aliases() {
    assert_eq!(normalize_level("WARNING"), Some("warn"));
    assert_eq!(normalize_level(" Critical "), Some("error"));
    assert_eq!(normalize_level("debug"), Some("debug"));
    assert_eq!(normalize_level("verbose"), None);
  }

  #[test]
  fn cleanup_removes_only_expired_forwarder_logs() {
    let dir = tempfile::tempdir().unwrap();
    let old = dir.path().join("misp-forwarder.log.2020-01-01");
    let fresh = dir.path().join("misp-forwarder.log.2099-01-01");
    let other = dir.path().join("unrelated.log");
    for p in [&old, &fresh, &other] {
      fs::write(p, b"x").unwrap();
    }
    let ancient = filetime::FileTime::from_unix_time(1_000_000, 0);
    filetime::set_file_mtime(&old, ancient).unwrap();
    filetime::set_file_mtime(&other, ancient).unwrap();

    cleanup_old_logs(dir.path(), 14).unwrap();
    assert!(!old.exists());
    assert!(fresh.exists());
    assert!(other.exists());
  }
}
