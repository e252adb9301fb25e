use crate::state::atomic_write_file;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Payload-size safety limit for one ingestion call.
pub const MAX_BATCH_SIZE: usize = 500;

pub const DEFAULT_INGESTION_URL: &str =
  "https://malachiteingestion-pa.googleapis.com/v2/entities:batchCreate";

#[derive(Debug, Clone, Default)]
pub struct Config {
  pub source: SourceConfig,
  pub sink: SinkConfig,
  pub sync: SyncSettings,
  pub logging: LoggingConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
  #[serde(default)]
  pub url: String,

  #[serde(default)]
  pub api_key: String,

  #[serde(default = "default_true")]
  pub verify_tls: bool,
}

impl Default for SourceConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      api_key: String::new(),
      verify_tls: true,
    }
  }
}

impl std::fmt::Debug for SourceConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SourceConfig")
      .field("url", &self.url)
      .field("api_key", &"<redacted>")
      .field("verify_tls", &self.verify_tls)
      .finish()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
  #[serde(default)]
  pub credentials_path: String,

  #[serde(default)]
  pub customer_id: String,

  #[serde(default)]
  pub project_id: String,

  #[serde(default = "default_ingestion_url")]
  pub ingestion_url: String,

  #[serde(default = "default_log_type")]
  pub log_type: String,
}

impl Default for SinkConfig {
  fn default() -> Self {
    Self {
      credentials_path: String::new(),
      customer_id: String::new(),
      project_id: String::new(),
      ingestion_url: default_ingestion_url(),
      log_type: default_log_type(),
    }
  }
}

/// Reloadable sync settings. A snapshot is handed to each cycle and only
/// replaced between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSettings {
  pub fetch_interval_seconds: u64,
  pub page_size: u32,
  pub batch_size: usize,
  pub historical_polling: String,
  pub test_mode: bool,
  pub max_test_events: u64,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      fetch_interval_seconds: 3600,
      page_size: 100,
      batch_size: 100,
      historical_polling: "0".to_string(),
      test_mode: false,
      max_test_events: 3,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dir: Option<String>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      retention_days: default_retention_days(),
      dir: None,
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_ingestion_url() -> String {
  DEFAULT_INGESTION_URL.to_string()
}

fn default_log_type() -> String {
  "MISP_IOC".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  14
}

#[derive(Serialize)]
struct ConfigTemplate<'a> {
  source: &'a SourceConfig,
  sink: &'a SinkConfig,
  sync: &'a SyncSettings,
  logging: &'a LoggingConfig,
}

/// `[logging]` only, read before the subscriber exists so it can be configured.
/// Anything unreadable yields defaults; the full load reports the problem.
pub fn startup_logging(path: &Path) -> LoggingConfig {
  match read_table(path) {
    Ok(table) => LoggingConfig::default().merged_with(table_section(&table, "logging")),
    Err(_) => LoggingConfig::default(),
  }
}

/// Startup load. A missing file is replaced by a template; an unparsable file
/// is reported and ignored so that environment-only deployments still start.
/// Required settings are checked separately by [`validate_startup`].
/// Expects logging to be initialised already, so fallbacks are reported.
pub fn load_or_create_default(path: &Path) -> anyhow::Result<Config> {
  let mut cfg = Config::default();

  if !path.exists() {
    let template = ConfigTemplate {
      source: &cfg.source,
      sink: &cfg.sink,
      sync: &cfg.sync,
      logging: &cfg.logging,
    };
    let raw = toml::to_string_pretty(&template)?;
    match atomic_write_file(path, raw.as_bytes()) {
      Ok(()) => tracing::warn!(path = %path.display(), "no config found; wrote a default template"),
      Err(e) => tracing::error!(
        path = %path.display(),
        error = ?e,
        "no config found and a template could not be written"
      ),
    }
  } else {
    match read_table(path) {
      Ok(table) => {
        cfg.source = section(&table, "source").unwrap_or_default();
        cfg.sink = section(&table, "sink").unwrap_or_default();
        cfg.sync = cfg.sync.merged_with(table_section(&table, "sync"));
        cfg.logging = cfg.logging.merged_with(table_section(&table, "logging"));
      }
      Err(e) => tracing::error!(
        path = %path.display(),
        error = ?e,
        "invalid config; using defaults and environment"
      ),
    }
  }

  apply_env(&mut cfg, |key| std::env::var(key).ok());
  Ok(cfg)
}

/// Re-reads `[sync]` and `[logging]` on top of `current`. Connection settings
/// are fixed for the life of the process.
pub fn reload(path: &Path, current: &Config) -> anyhow::Result<Config> {
  let table = read_table(path)?;

  let source_changed = section::<SourceConfig>(&table, "source")
    .map(|s| s.url != current.source.url || s.api_key != current.source.api_key)
    .unwrap_or(false);
  let sink_changed = section::<SinkConfig>(&table, "sink")
    .map(|s| s != current.sink)
    .unwrap_or(false);
  if source_changed || sink_changed {
    tracing::warn!("connection settings changed in config; they take effect after a restart");
  }

  Ok(Config {
    source: current.source.clone(),
    sink: current.sink.clone(),
    sync: current.sync.merged_with(table_section(&table, "sync")),
    logging: current.logging.merged_with(table_section(&table, "logging")),
  })
}

pub fn validate_startup(cfg: &Config) -> anyhow::Result<()> {
  let mut missing = Vec::new();
  if cfg.source.url.trim().is_empty() {
    missing.push("source.url (MISP_URL)");
  }
  if cfg.source.api_key.trim().is_empty() {
    missing.push("source.api_key (MISP_API_KEY)");
  }
  if cfg.sink.credentials_path.trim().is_empty() {
    missing.push("sink.credentials_path (GOOGLE_SA_CREDENTIALS)");
  }
  if cfg.sink.customer_id.trim().is_empty() {
    missing.push("sink.customer_id (GOOGLE_CUSTOMER_ID)");
  }
  if !missing.is_empty() {
    anyhow::bail!("missing required settings: {}", missing.join(", "));
  }

  reqwest::Url::parse(&cfg.source.url)
    .with_context(|| format!("source.url is not a valid URL: {}", cfg.source.url))?;
  reqwest::Url::parse(&cfg.sink.ingestion_url)
    .with_context(|| format!("sink.ingestion_url is not a valid URL: {}", cfg.sink.ingestion_url))?;
  Ok(())
}

pub(crate) fn apply_env(cfg: &mut Config, get: impl Fn(&str) -> Option<String>) {
  let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

  if let Some(v) = non_empty("MISP_URL") {
    cfg.source.url = v;
  }
  if let Some(v) = non_empty("MISP_API_KEY") {
    cfg.source.api_key = v;
  }
  if let Some(v) = non_empty("MISP_VERIFY_SSL") {
    cfg.source.verify_tls = v.trim().eq_ignore_ascii_case("true");
  }
  if let Some(v) = non_empty("GOOGLE_SA_CREDENTIALS") {
    cfg.sink.credentials_path = v;
  }
  if let Some(v) = non_empty("GOOGLE_CUSTOMER_ID") {
    cfg.sink.customer_id = v;
  }
  if let Some(v) = non_empty("GOOGLE_PROJECT_ID") {
    cfg.sink.project_id = v;
  }
  if let Some(v) = non_empty("SECOPS_ENTITY_API_URL") {
    cfg.sink.ingestion_url = v;
  }
}

impl SyncSettings {
  /// New snapshot with every valid key from `section` applied. Invalid keys keep
  /// the value from `self`.
  pub fn merged_with(&self, section: Option<&toml::Table>) -> SyncSettings {
    let Some(t) = section else {
      return self.clone();
    };

    let mut batch_size = validated(t, "sync.batch_size", self.batch_size, |v: &usize| {
      (*v >= 1).then_some(()).ok_or("must be at least 1")
    });
    if batch_size > MAX_BATCH_SIZE {
      tracing::warn!(
        configured = batch_size,
        max = MAX_BATCH_SIZE,
        "sync.batch_size exceeds the payload safety limit; clamped"
      );
      batch_size = MAX_BATCH_SIZE;
    }

    SyncSettings {
      fetch_interval_seconds: validated(
        t,
        "sync.fetch_interval_seconds",
        self.fetch_interval_seconds,
        |v: &u64| (*v >= 1).then_some(()).ok_or("must be at least 1 second"),
      ),
      page_size: validated(t, "sync.page_size", self.page_size, |v: &u32| {
        (*v >= 1).then_some(()).ok_or("must be at least 1")
      }),
      batch_size,
      historical_polling: historical_field(t, &self.historical_polling),
      test_mode: validated(t, "sync.test_mode", self.test_mode, |_| Ok(())),
      max_test_events: validated(t, "sync.max_test_events", self.max_test_events, |v: &u64| {
        (*v >= 1).then_some(()).ok_or("must be at least 1")
      }),
    }
  }
}

impl LoggingConfig {
  pub fn merged_with(&self, section: Option<&toml::Table>) -> LoggingConfig {
    let Some(t) = section else {
      return self.clone();
    };
    LoggingConfig {
      level: validated(t, "logging.level", self.level.clone(), |v: &String| {
        crate::logging::normalize_level(v)
          .map(|_| ())
          .ok_or("expected one of trace, debug, info, warn, error")
      }),
      retention_days: validated(t, "logging.retention_days", self.retention_days, |_| Ok(())),
      dir: validated(t, "logging.dir", self.dir.clone(), |_| Ok(())),
    }
  }
}

fn historical_field(t: &toml::Table, prev: &str) -> String {
  match t.get("historical_polling") {
    None => prev.to_string(),
    Some(toml::Value::String(s)) => s.trim().to_string(),
    Some(toml::Value::Integer(i)) => i.to_string(),
    Some(other) => {
      tracing::warn!(
        key = "sync.historical_polling",
        found = other.type_str(),
        "invalid config value; keeping previous"
      );
      prev.to_string()
    }
  }
}

fn validated<T, V>(t: &toml::Table, key: &str, prev: T, check: V) -> T
where
  T: DeserializeOwned,
  V: Fn(&T) -> Result<(), &'static str>,
{
  let name = key.rsplit('.').next().unwrap_or(key);
  let Some(raw) = t.get(name) else {
    return prev;
  };
  let parsed = raw
    .clone()
    .try_into::<T>()
    .map_err(|e| e.to_string())
    .and_then(|v| check(&v).map(|_| v).map_err(str::to_string));
  match parsed {
    Ok(v) => v,
    Err(reason) => {
      tracing::warn!(key, reason = %reason, "invalid config value; keeping previous");
      prev
    }
  }
}

fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
  let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
  raw
    .parse::<toml::Table>()
    .with_context(|| format!("parse {}", path.display()))
}

fn table_section<'a>(t: &'a toml::Table, name: &str) -> Option<&'a toml::Table> {
  t.get(name).and_then(|v| v.as_table())
}

fn section<T: DeserializeOwned>(t: &toml::Table, name: &str) -> Option<T> {
  let raw = t.get(name)?.clone();
  match raw.try_into::<T>() {
    Ok(v) => Some(v),
    Err(e) => {
      tracing::warn!(section = name, error = %e, "invalid config section; using defaults");
      None
    }
  }
}

/// Watches the config file's modification time.
#[derive(Debug)]
pub struct ConfigWatcher {
  path: PathBuf,
  last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    let last_modified = modified(&path);
    Self {
      path,
      last_modified,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// True once per observed modification. A vanished file is not a change.
  pub fn poll_changed(&mut self) -> bool {
    let Some(current) = modified(&self.path) else {
      return false;
    };
    if self.last_modified == Some(current) {
      return false;
    }
    self.last_modified = Some(current);
    true
  }
}

fn modified(path: &Path) -> Option<SystemTime> {
  fs::metadata(path).and_then(|m| m.modified()).ok()
}
