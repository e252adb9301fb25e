use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "MISP_FORWARDER_HOME";

/// Working root for relative defaults: `$MISP_FORWARDER_HOME`, else the current directory.
pub fn base_dir() -> anyhow::Result<PathBuf> {
  match std::env::var_os(HOME_ENV) {
    Some(home) if !home.is_empty() => Ok(PathBuf::from(home)),
    _ => Ok(std::env::current_dir()?),
  }
}

pub fn config_path(base: &Path) -> PathBuf {
  base.join("config.toml")
}

pub fn data_dir(base: &Path) -> PathBuf {
  base.join("misp_data")
}

pub fn state_path(base: &Path) -> PathBuf {
  data_dir(base).join("state.json")
}

/// Relative log directories in config are resolved against the base dir.
pub fn resolve(base: &Path, configured: &str) -> PathBuf {
  let p = Path::new(configured);
  if p.is_absolute() {
    p.to_path_buf()
  } else {
    base.join(p)
  }
}
