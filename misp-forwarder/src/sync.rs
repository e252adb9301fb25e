use crate::config::SyncSettings;
use crate::error::RemoteError;
use crate::governor::TestGovernor;
use crate::sink::EntitySink;
use crate::source::{FetchWindow, IndicatorSource};
use crate::translate::translate_page;
use crate::types::NormalizedEntity;
use std::collections::HashMap;
use std::time::Duration;

/// Skip-tally key for records the source could not decode.
pub const MALFORMED_KIND: &str = "malformed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
  ConfigChanged,
  Shutdown,
}

/// Cooperative cancellation, checked at page boundaries and while sleeping.
pub trait Interrupts {
  fn poll(&mut self) -> Option<Interrupt>;

  /// Sleeps up to `duration`, returning early on an interrupt.
  fn sleep(&mut self, duration: Duration) -> Option<Interrupt>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
  pub pages: u32,
  pub processed: usize,
  pub forwarded: usize,
  pub skipped: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
  /// Pagination finished. The caller may advance the watermark.
  Completed(CycleReport),
  /// Abandoned at a checkpoint; the watermark must stay where it was.
  Interrupted(Interrupt),
  /// The test-mode allowance was used up during this cycle.
  TestCapReached(CycleReport),
}

/// One fetch/translate/forward pass over `[since, started_at)`.
pub fn run_cycle(
  settings: &SyncSettings,
  since: Option<i64>,
  started_at: i64,
  source: &dyn IndicatorSource,
  sink: &mut dyn EntitySink,
  governor: &mut TestGovernor,
  interrupts: &mut dyn Interrupts,
) -> Result<CycleOutcome, RemoteError> {
  let span = tracing::info_span!("sync_cycle", cycle_id = %uuid::Uuid::new_v4());
  let _enter = span.enter();

  let window = FetchWindow {
    since,
    until: since.map(|_| started_at),
  };
  tracing::info!(since = ?since, until = started_at, "sync cycle started");

  let mut report = CycleReport::default();
  let mut page = 1u32;

  loop {
    if let Some(interrupt) = interrupts.poll() {
      tracing::info!(?interrupt, page, "sync cycle interrupted");
      return Ok(CycleOutcome::Interrupted(interrupt));
    }

    let fetched = source.fetch(window, page, settings.page_size)?;
    if fetched.is_empty() {
      tracing::info!(page, "no more indicators");
      break;
    }
    report.pages += 1;
    report.processed += fetched.len();
    if fetched.rejected > 0 {
      *report.skipped.entry(MALFORMED_KIND.to_string()).or_default() += fetched.rejected;
    }

    let translated = translate_page(&fetched.records, chrono::Utc::now());
    if translated.skipped_total() > 0 {
      tracing::info!(
        page,
        skipped = translated.skipped_total(),
        kinds = ?translated.skipped,
        "skipped unsupported indicator kinds"
      );
    }
    for (kind, n) in translated.skipped {
      *report.skipped.entry(kind).or_default() += n;
    }

    let mut pending: &[NormalizedEntity] = &translated.entities;
    while !pending.is_empty() {
      let len = governor.next_chunk_len(settings, pending.len());
      if len == 0 {
        break;
      }
      let (chunk, rest) = pending.split_at(len);
      log_entities(chunk);
      sink.send(chunk)?;
      governor.record(chunk.len());
      report.forwarded += chunk.len();
      pending = rest;

      if governor.reached(settings) {
        tracing::info!(
          total_sent = governor.total_sent(),
          max_test_events = settings.max_test_events,
          "test mode limit reached"
        );
        return Ok(CycleOutcome::TestCapReached(report));
      }
    }

    page += 1;
  }

  tracing::info!(
    pages = report.pages,
    processed = report.processed,
    forwarded = report.forwarded,
    "sync cycle completed"
  );
  Ok(CycleOutcome::Completed(report))
}

fn log_entities(chunk: &[NormalizedEntity]) {
  if !tracing::enabled!(tracing::Level::DEBUG) {
    return;
  }
  for e in chunk {
    tracing::debug!(
      entity_type = ?e.metadata.entity_type,
      value = e.entity.display_value(),
      vendor = %e.metadata.vendor_name,
      product = %e.metadata.product_name,
      "forwarding entity"
    );
  }
}
