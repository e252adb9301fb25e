use crate::backfill;
use crate::config::{self, Config, ConfigWatcher};
use crate::error::RemoteError;
use crate::governor::TestGovernor;
use crate::logging;
use crate::sink::EntitySink;
use crate::source::IndicatorSource;
use crate::state::{Watermark, WatermarkStore};
use crate::sync::{run_cycle, CycleOutcome, Interrupt, Interrupts};
use crate::types::now_unix_s;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Why the supervisor returned. Both are clean exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
  Shutdown,
  TestCapReached,
}

/// Live interrupts: the stop channel fed by the signal handler, and the
/// config file's mtime, checked once per tick.
pub struct ReloadMonitor {
  watcher: ConfigWatcher,
  stop_rx: Receiver<()>,
  tick: Duration,
}

impl ReloadMonitor {
  pub fn new(watcher: ConfigWatcher, stop_rx: Receiver<()>, tick: Duration) -> Self {
    Self {
      watcher,
      stop_rx,
      tick,
    }
  }

  fn stop_requested(&self) -> bool {
    match self.stop_rx.try_recv() {
      Ok(()) => true,
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
    }
  }
}

impl Interrupts for ReloadMonitor {
  fn poll(&mut self) -> Option<Interrupt> {
    if self.stop_requested() {
      return Some(Interrupt::Shutdown);
    }
    if self.watcher.poll_changed() {
      tracing::info!(path = %self.watcher.path().display(), "configuration file changed");
      return Some(Interrupt::ConfigChanged);
    }
    None
  }

  fn sleep(&mut self, duration: Duration) -> Option<Interrupt> {
    let deadline = Instant::now() + duration;
    loop {
      if let Some(interrupt) = self.poll() {
        return Some(interrupt);
      }
      let now = Instant::now();
      if now >= deadline {
        return None;
      }
      let wait = (deadline - now).min(self.tick);
      match self.stop_rx.recv_timeout(wait) {
        Ok(()) => return Some(Interrupt::Shutdown),
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wait),
      }
    }
  }
}

/// Persisted marker of the historical policy the watermark belongs to.
fn policy_signature(raw: &str) -> String {
  raw.trim().to_string()
}

/// Owns the watermark and the live settings; drives cycles until a clean exit.
pub struct Supervisor {
  config_path: PathBuf,
  config: Config,
  store: WatermarkStore,
  watermark: Watermark,
  source: Box<dyn IndicatorSource>,
  sink: Box<dyn EntitySink>,
  governor: TestGovernor,
  error_backoff: Duration,
}

impl Supervisor {
  /// Loads the durable watermark and reconciles it with the configured
  /// historical policy.
  pub fn new(
    config_path: impl Into<PathBuf>,
    config: Config,
    store: WatermarkStore,
    source: Box<dyn IndicatorSource>,
    sink: Box<dyn EntitySink>,
  ) -> Self {
    let watermark = store.load();
    tracing::info!(
      path = %store.path().display(),
      last_timestamp = ?watermark.last_timestamp,
      historical = ?watermark.last_historical_config,
      "sync state loaded"
    );
    let mut sup = Self {
      config_path: config_path.into(),
      config,
      store,
      watermark,
      source,
      sink,
      governor: TestGovernor::new(),
      error_backoff: ERROR_BACKOFF,
    };
    sup.init_watermark(Utc::now());
    sup
  }

  pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
    self.error_backoff = backoff;
    self
  }

  pub fn watermark(&self) -> &Watermark {
    &self.watermark
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  fn init_watermark(&mut self, now: DateTime<Utc>) {
    let raw = self.config.sync.historical_polling.clone();
    let signature = policy_signature(&raw);

    let recorded = self.watermark.last_historical_config.clone();
    match recorded.as_deref() {
      Some(previous) if previous != signature => {
        tracing::info!(
          previous,
          current = %signature,
          "historical polling changed since last run"
        );
        self.reset_watermark(&raw, now);
        return;
      }
      Some(_) => {}
      // State written before the policy was tracked: adopt it as-is.
      None => self.watermark.last_historical_config = Some(signature),
    }

    if self.watermark.is_empty() {
      match backfill::backfill_start(&raw, now) {
        Some(start) => tracing::info!(
          days = backfill::resolve_offset_days(&raw, now),
          start,
          "first run: backfilling historical indicators"
        ),
        None => tracing::info!("first run: monitoring new indicators from now"),
      }
      self.watermark.last_timestamp = Some(backfill::initial_watermark(&raw, now));
    }
    self.store.save(&self.watermark);
  }

  fn reset_watermark(&mut self, raw: &str, now: DateTime<Utc>) {
    let start = backfill::initial_watermark(raw, now);
    tracing::info!(
      from = ?self.watermark.last_timestamp,
      to = start,
      "resetting sync watermark for new historical polling setting"
    );
    self.watermark = Watermark {
      last_timestamp: Some(start),
      last_historical_config: Some(policy_signature(raw)),
    };
    self.store.save(&self.watermark);
  }

  fn reload(&mut self) {
    let next = match config::reload(&self.config_path, &self.config) {
      Ok(c) => c,
      Err(e) => {
        tracing::warn!(error = ?e, "config reload failed; keeping current settings");
        return;
      }
    };

    logging::set_level(&next.logging.level);
    if next.sync != self.config.sync {
      tracing::info!(settings = ?next.sync, "sync settings reloaded");
    }
    self.config = next;

    let raw = self.config.sync.historical_polling.clone();
    if self.watermark.last_historical_config.as_deref() != Some(policy_signature(&raw).as_str()) {
      self.reset_watermark(&raw, Utc::now());
    }
  }

  fn advance(&mut self, started_at: i64) {
    self.watermark.last_timestamp = Some(started_at);
    self.store.save(&self.watermark);
  }

  /// Returns whether the failure was an authorization rejection.
  fn log_cycle_failure(&self, e: &RemoteError) -> bool {
    let backoff_s = self.error_backoff.as_secs();
    if e.is_authorization() {
      tracing::error!(
        error = %e,
        status = ?e.status(),
        backoff_s,
        "credentials rejected; check the API key or service account permissions"
      );
      return true;
    }
    tracing::error!(
      error = %e,
      status = ?e.status(),
      backoff_s,
      "sync cycle failed; backing off"
    );
    false
  }

  pub fn run(&mut self, interrupts: &mut dyn Interrupts) -> RunExit {
    loop {
      match interrupts.poll() {
        Some(Interrupt::Shutdown) => return RunExit::Shutdown,
        Some(Interrupt::ConfigChanged) => {
          self.reload();
          continue;
        }
        None => {}
      }

      let settings = self.config.sync.clone();
      if self.governor.reached(&settings) {
        return RunExit::TestCapReached;
      }

      let started_at = now_unix_s();
      let outcome = run_cycle(
        &settings,
        self.watermark.last_timestamp,
        started_at,
        self.source.as_ref(),
        self.sink.as_mut(),
        &mut self.governor,
        interrupts,
      );

      let pause = match outcome {
        Ok(CycleOutcome::Completed(report)) => {
          if report.processed > 0 {
            self.advance(started_at);
          } else {
            tracing::info!("no new indicators; watermark unchanged");
          }
          Duration::from_secs(settings.fetch_interval_seconds)
        }
        Ok(CycleOutcome::TestCapReached(_)) => {
          tracing::info!(
            total_sent = self.governor.total_sent(),
            "test mode complete; stopping"
          );
          return RunExit::TestCapReached;
        }
        Ok(CycleOutcome::Interrupted(Interrupt::Shutdown)) => return RunExit::Shutdown,
        Ok(CycleOutcome::Interrupted(Interrupt::ConfigChanged)) => {
          self.reload();
          continue;
        }
        Err(e) => {
          self.log_cycle_failure(&e);
          self.error_backoff
        }
      };

      tracing::info!(seconds = pause.as_secs(), "sleeping until next cycle");
      match interrupts.sleep(pause) {
        Some(Interrupt::Shutdown) => return RunExit::Shutdown,
        Some(Interrupt::ConfigChanged) => self.reload(),
        None => {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::SyncSettings;
  use crate::sync::testing::{indicators, FakeSink, FakeSource, ScriptedInterrupts};
  use std::fs;
  use std::path::Path;
  use std::sync::mpsc;

  const DAY: i64 = 24 * 60 * 60;

  struct Env {
    _dir: tempfile::TempDir,
    config_path: PathBuf,
    state_path: PathBuf,
  }

  impl Env {
    fn new(sync_section: &str) -> Self {
      let dir = tempfile::tempdir().unwrap();
      let config_path = dir.path().join("config.toml");
      let state_path = dir.path().join("misp_data").join("state.json");
      write_sync(&config_path, sync_section);
      Self {
        _dir: dir,
        config_path,
        state_path,
      }
    }

    fn store(&self) -> WatermarkStore {
      WatermarkStore::new(&self.state_path)
    }

    fn seed(&self, last_timestamp: i64, signature: Option<&str>) {
      self.store().save(&Watermark {
        last_timestamp: Some(last_timestamp),
        last_historical_config: signature.map(str::to_string),
      });
    }

    fn supervisor(&self, source: &FakeSource, sink: &FakeSink) -> Supervisor {
      let table: toml::Table = fs::read_to_string(&self.config_path).unwrap().parse().unwrap();
      let sync = table.get("sync").and_then(|v| v.as_table());
      let config = Config {
        sync: SyncSettings::default().merged_with(sync),
        ..Config::default()
      };
      Supervisor::new(
        &self.config_path,
        config,
        self.store(),
        Box::new(source.clone()),
        Box::new(sink.clone()),
      )
      .with_error_backoff(Duration::from_millis(1))
    }
  }

  fn write_sync(path: &Path, body: &str) {
    fs::write(path, format!("[sync]\n{body}\n")).unwrap();
  }

  fn near(actual: Option<i64>, expected: i64) -> bool {
    actual.is_some_and(|a| (a - expected).abs() <= 5)
  }

  #[test]
  fn first_run_without_backfill_starts_from_now() {
    let env = Env::new("historical_polling = \"0\"");
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());

    assert!(near(sup.watermark().last_timestamp, now_unix_s()));
    let saved = env.store().load();
    assert_eq!(saved, *sup.watermark());
    assert_eq!(saved.last_historical_config.as_deref(), Some("0"));
  }

  #[test]
  fn first_run_with_backfill_starts_in_the_past() {
    let env = Env::new("historical_polling = 7");
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    assert!(near(sup.watermark().last_timestamp, now_unix_s() - 7 * DAY));
    assert_eq!(sup.watermark().last_historical_config.as_deref(), Some("7"));
  }

  #[test]
  fn restart_with_same_policy_keeps_progress() {
    let env = Env::new("historical_polling = \"30\"");
    env.seed(1_700_000_000, Some("30"));
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    assert_eq!(sup.watermark().last_timestamp, Some(1_700_000_000));
  }

  #[test]
  fn restart_with_changed_policy_resets_once() {
    let env = Env::new("historical_polling = \"10\"");
    env.seed(1_700_000_000, Some("30"));
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    assert!(near(sup.watermark().last_timestamp, now_unix_s() - 10 * DAY));
    drop(sup);

    // A plain restart must not reset again.
    env.seed(1_700_000_123, Some("10"));
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    assert_eq!(sup.watermark().last_timestamp, Some(1_700_000_123));
  }

  #[test]
  fn legacy_state_adopts_current_policy() {
    let env = Env::new("historical_polling = \"10\"");
    env.seed(1_700_000_000, None);
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    assert_eq!(sup.watermark().last_timestamp, Some(1_700_000_000));
    assert_eq!(env.store().load().last_historical_config.as_deref(), Some("10"));
  }

  #[test]
  fn completed_cycle_advances_watermark_to_cycle_start() {
    let env = Env::new("historical_polling = \"0\"");
    env.seed(1_000, Some("0"));
    let source = FakeSource::with_pages(vec![indicators("domain", 2)]);
    let sink = FakeSink::default();
    let mut sup = env.supervisor(&source, &sink);

    let before = now_unix_s();
    // poll 1: before cycle, 2: page 1, 3: page 2 (empty), 4: sleep.
    let exit = sup.run(&mut ScriptedInterrupts::at(4, Interrupt::Shutdown));
    let after = now_unix_s();

    assert_eq!(exit, RunExit::Shutdown);
    assert_eq!(sink.sent(), 2);
    let saved = env.store().load().last_timestamp.unwrap();
    assert!(saved >= before && saved <= after);
    assert_eq!(source.calls.borrow()[0].0.since, Some(1_000));
  }

  #[test]
  fn empty_cycle_leaves_watermark() {
    let env = Env::new("historical_polling = \"0\"");
    env.seed(1_000, Some("0"));
    let mut sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    let exit = sup.run(&mut ScriptedInterrupts::at(3, Interrupt::Shutdown));
    assert_eq!(exit, RunExit::Shutdown);
    assert_eq!(env.store().load().last_timestamp, Some(1_000));
  }

  #[test]
  fn test_cap_ends_run_without_advancing() {
    let env = Env::new(
      "historical_polling = \"0\"\nbatch_size = 2\ntest_mode = true\nmax_test_events = 3",
    );
    env.seed(1_000, Some("0"));
    let source = FakeSource::with_pages(vec![indicators("ip-dst", 10)]);
    let sink = FakeSink::default();
    let mut sup = env.supervisor(&source, &sink);

    let exit = sup.run(&mut ScriptedInterrupts::never());
    assert_eq!(exit, RunExit::TestCapReached);
    assert_eq!(sink.sent(), 3);
    assert_eq!(env.store().load().last_timestamp, Some(1_000));
  }

  #[test]
  fn historical_change_during_run_resets_watermark() {
    let env = Env::new("historical_polling = \"0\"");
    env.seed(1_000, Some("0"));
    let source = FakeSource::with_pages(vec![indicators("domain", 1)]);
    let mut sup = env.supervisor(&source, &FakeSink::default());

    let path = env.config_path.clone();
    let mut script = ScriptedInterrupts::at(1, Interrupt::ConfigChanged)
      .then(3, Interrupt::Shutdown)
      .on_poll(move |n| {
        if n == 1 {
          write_sync(&path, "historical_polling = \"10\"");
        }
      });

    assert_eq!(sup.run(&mut script), RunExit::Shutdown);
    assert!(source.calls.borrow().is_empty());
    let saved = env.store().load();
    assert!(near(saved.last_timestamp, now_unix_s() - 10 * DAY));
    assert_eq!(saved.last_historical_config.as_deref(), Some("10"));
  }

  #[test]
  fn other_setting_change_keeps_watermark() {
    let env = Env::new("historical_polling = \"5\"\nbatch_size = 100");
    env.seed(1_000, Some("5"));
    let mut sup = env.supervisor(&FakeSource::default(), &FakeSink::default());

    let path = env.config_path.clone();
    let mut script = ScriptedInterrupts::at(1, Interrupt::ConfigChanged)
      .then(2, Interrupt::Shutdown)
      .on_poll(move |n| {
        if n == 1 {
          write_sync(&path, "historical_polling = \"5\"\nbatch_size = 7");
        }
      });

    assert_eq!(sup.run(&mut script), RunExit::Shutdown);
    assert_eq!(sup.config().sync.batch_size, 7);
    assert_eq!(sup.watermark().last_timestamp, Some(1_000));
    assert_eq!(env.store().load().last_timestamp, Some(1_000));
  }

  #[test]
  fn config_change_mid_pagination_abandons_cycle() {
    let env = Env::new("historical_polling = \"0\"");
    env.seed(1_000, Some("0"));
    let source = FakeSource::with_pages(vec![indicators("domain", 2), indicators("domain", 2)]);
    let sink = FakeSink::default();
    let mut sup = env.supervisor(&source, &sink);

    // poll 2 is page 1, poll 3 would be page 2.
    let mut script = ScriptedInterrupts::at(3, Interrupt::ConfigChanged).then(4, Interrupt::Shutdown);
    assert_eq!(sup.run(&mut script), RunExit::Shutdown);
    assert_eq!(*sink.batches.borrow(), vec![2]);
    assert_eq!(source.calls.borrow().len(), 1);
    assert_eq!(env.store().load().last_timestamp, Some(1_000));
  }

  #[test]
  fn remote_failure_backs_off_and_keeps_watermark() {
    let env = Env::new("historical_polling = \"0\"");
    env.seed(1_000, Some("0"));
    let source = FakeSource::with_pages(vec![indicators("domain", 2)]);
    let sink = FakeSink {
      fail_with: Some(401),
      ..FakeSink::default()
    };
    let mut sup = env.supervisor(&source, &sink);

    // poll 1: before cycle, 2: page 1 then failure, 3: back-off sleep.
    let exit = sup.run(&mut ScriptedInterrupts::at(3, Interrupt::Shutdown));
    assert_eq!(exit, RunExit::Shutdown);
    assert_eq!(env.store().load().last_timestamp, Some(1_000));
  }

  #[test]
  fn authorization_failures_are_reported_separately() {
    use crate::error::{MISP, SECOPS};

    let env = Env::new("historical_polling = \"0\"");
    let sup = env.supervisor(&FakeSource::default(), &FakeSink::default());
    assert!(sup.log_cycle_failure(&RemoteError::from_status(SECOPS, "x/ingest", 403, "")));
    assert!(sup.log_cycle_failure(&RemoteError::from_status(MISP, "x/search", 401, "")));
    assert!(!sup.log_cycle_failure(&RemoteError::from_status(MISP, "x/search", 503, "")));
  }

  #[test]
  fn monitor_reports_stop_and_file_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    write_sync(&path, "batch_size = 1");
    let (tx, rx) = mpsc::channel::<()>();
    let mut monitor = ReloadMonitor::new(ConfigWatcher::new(&path), rx, Duration::from_millis(5));

    assert_eq!(monitor.sleep(Duration::from_millis(20)), None);

    let later = filetime::FileTime::from_unix_time(now_unix_s() + 60, 0);
    filetime::set_file_mtime(&path, later).unwrap();
    assert_eq!(monitor.poll(), Some(Interrupt::ConfigChanged));
    assert_eq!(monitor.poll(), None);

    tx.send(()).unwrap();
    assert_eq!(monitor.sleep(Duration::from_secs(30)), Some(Interrupt::Shutdown));

    drop(tx);
    assert_eq!(monitor.sleep(Duration::from_millis(10)), None);
  }
}
