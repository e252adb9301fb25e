use crate::config::SyncSettings;

/// Lifetime count of forwarded entities, capped when test mode is on.
#[derive(Debug, Default, Clone)]
pub struct TestGovernor {
  total_sent: u64,
}

impl TestGovernor {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn total_sent(&self) -> u64 {
    self.total_sent
  }

  /// How many more entities may be sent. `None` means unlimited.
  pub fn remaining(&self, settings: &SyncSettings) -> Option<u64> {
    if !settings.test_mode {
      return None;
    }
    Some(settings.max_test_events.saturating_sub(self.total_sent))
  }

  pub fn record(&mut self, sent: usize) {
    self.total_sent = self.total_sent.saturating_add(sent as u64);
  }

  pub fn reached(&self, settings: &SyncSettings) -> bool {
    self.remaining(settings) == Some(0)
  }

  /// Largest chunk allowed next, given the configured batch size.
  pub fn next_chunk_len(&self, settings: &SyncSettings, available: usize) -> usize {
    let len = available.min(settings.batch_size.max(1));
    match self.remaining(settings) {
      Some(left) => len.min(usize::try_from(left).unwrap_or(usize::MAX)),
      None => len,
    }
  }
}
