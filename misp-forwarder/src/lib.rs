pub mod backfill;
pub mod config;
pub mod error;
pub mod governor;
pub mod logging;
pub mod paths;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod supervisor;
pub mod sync;
pub mod translate;
pub mod types;

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
  pub config: PathBuf,
  pub state: PathBuf,
}

/// `--config <path>` and `--state <path>`; anything else is ignored.
pub fn parse_args(args: &[String], base: &Path) -> anyhow::Result<CliArgs> {
  let mut cli = CliArgs {
    config: paths::config_path(base),
    state: paths::state_path(base),
  };

  let mut it = args.iter().skip(1);
  while let Some(arg) = it.next() {
    let slot = match arg.as_str() {
      "--config" => &mut cli.config,
      "--state" => &mut cli.state,
      _ => continue,
    };
    let value = it
      .next()
      .filter(|v| !v.starts_with("--"))
      .with_context(|| format!("{arg} requires a path"))?;
    *slot = PathBuf::from(value);
  }
  Ok(cli)
}

pub fn run(args: &[String]) -> anyhow::Result<()> {
  let base = paths::base_dir()?;
  let cli = parse_args(args, &base)?;

  let log_cfg = config::startup_logging(&cli.config);
  let log_dir = log_cfg.dir.as_deref().map(|d| paths::resolve(&base, d));
  logging::init(log_dir.as_deref(), &log_cfg.level, log_cfg.retention_days)?;

  let cfg = config::load_or_create_default(&cli.config)?;
  let watcher = config::ConfigWatcher::new(&cli.config);

  tracing::info!(
    version = env!("CARGO_PKG_VERSION"),
    config = %cli.config.display(),
    state = %cli.state.display(),
    "starting misp-forwarder"
  );

  config::validate_startup(&cfg).context("invalid configuration")?;
  let tokens = sink::auth::ServiceAccountTokens::from_file(Path::new(&cfg.sink.credentials_path))
    .context("load Google service account credentials")?;

  let source = source::MispClient::new(&cfg.source)?;
  source.probe();
  let sink = sink::SecOpsClient::new(&cfg.sink, Box::new(tokens))?;

  tracing::info!(
    fetch_interval_seconds = cfg.sync.fetch_interval_seconds,
    page_size = cfg.sync.page_size,
    batch_size = cfg.sync.batch_size,
    historical_polling = %cfg.sync.historical_polling,
    "sync settings"
  );
  if cfg.sync.test_mode {
    tracing::warn!(
      max_test_events = cfg.sync.max_test_events,
      "test mode enabled; the forwarder stops once this many entities are sent"
    );
  }

  let (stop_tx, stop_rx) = mpsc::channel::<()>();
  ctrlc::set_handler(move || {
    let _ = stop_tx.send(());
  })
  .context("install signal handler")?;

  let mut monitor = supervisor::ReloadMonitor::new(
    watcher,
    stop_rx,
    supervisor::DEFAULT_TICK,
  );
  let mut sup = supervisor::Supervisor::new(
    &cli.config,
    cfg,
    state::WatermarkStore::new(&cli.state),
    Box::new(source),
    Box::new(sink),
  );

  match sup.run(&mut monitor) {
    supervisor::RunExit::Shutdown => tracing::info!("shutdown requested; misp-forwarder stopped"),
    supervisor::RunExit::TestCapReached => tracing::info!("test run finished; misp-forwarder stopped"),
  }
  Ok(())
}
