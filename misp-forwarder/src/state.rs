use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Durable sync progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
  #[serde(default)]
  pub last_timestamp: Option<i64>,

  #[serde(default)]
  pub last_historical_config: Option<String>,
}

impl Watermark {
  pub fn is_empty(&self) -> bool {
    self.last_timestamp.unwrap_or(0) == 0
  }
}

#[derive(Debug, Clone)]
pub struct WatermarkStore {
  path: PathBuf,
}

impl WatermarkStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Never fails: a missing or unreadable file yields an empty watermark.
  pub fn load(&self) -> Watermark {
    let bytes = match fs::read(&self.path) {
      Ok(b) => b,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Watermark::default(),
      Err(e) => {
        tracing::error!(
          path = %self.path.display(),
          error = %e,
          "unable to read sync state; starting from empty state"
        );
        return Watermark::default();
      }
    };

    match serde_json::from_slice::<Watermark>(&bytes) {
      Ok(w) => w,
      Err(e) => {
        tracing::error!(
          path = %self.path.display(),
          error = %e,
          "sync state is corrupt; starting from empty state"
        );
        Watermark::default()
      }
    }
  }

  /// Best-effort persist. Returns whether the write landed.
  pub fn save(&self, watermark: &Watermark) -> bool {
    match self.try_save(watermark) {
      Ok(()) => {
        tracing::info!(
          path = %self.path.display(),
          last_timestamp = ?watermark.last_timestamp,
          "sync state saved"
        );
        true
      }
      Err(e) => {
        tracing::error!(
          path = %self.path.display(),
          error = ?e,
          "failed to save sync state; the current range may be re-delivered after a restart"
        );
        false
      }
    }
  }

  fn try_save(&self, watermark: &Watermark) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(watermark)?;
    atomic_write_file(&self.path, &bytes)
  }
}

pub(crate) fn atomic_write_file(dst: &Path, bytes: &[u8]) -> anyhow::Result<()> {
  let dir = match dst.parent() {
    Some(p) if !p.as_os_str().is_empty() => p,
    _ => Path::new("."),
  };
  fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

  let tmp = tmp_path(dst);
  fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
  fs::rename(&tmp, dst).with_context(|| format!("rename {} -> {}", tmp.display(), dst.display()))?;
  Ok(())
}

fn tmp_path(dst: &Path) -> PathBuf {
  let name = dst.file_name().and_then(|s| s.to_str()).unwrap_or("tmp");
  dst.with_file_name(format!(".{name}.tmp"))
}
