use std::fmt::Display;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
  Transient,
  RateLimited,
  Fatal,
}

pub trait Retryable {
  fn retry_class(&self) -> RetryClass;
}

/// Bounded exponential backoff: `initial * 2^(attempt-1)`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  pub retry_rate_limited: bool,
}

impl RetryPolicy {
  /// MISP search: 3 attempts, 1s..10s, 429 is not retried.
  pub fn source() -> Self {
    Self {
      max_attempts: 3,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(10),
      retry_rate_limited: false,
    }
  }

  /// SecOps ingestion: 5 attempts, 2s..60s, 429 is retried.
  pub fn sink() -> Self {
    Self {
      max_attempts: 5,
      initial_backoff: Duration::from_secs(2),
      max_backoff: Duration::from_secs(60),
      retry_rate_limited: true,
    }
  }

  pub fn backoff_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self
      .initial_backoff
      .checked_mul(factor)
      .unwrap_or(self.max_backoff)
      .min(self.max_backoff)
  }

  pub fn should_retry<E: Retryable>(&self, err: &E) -> bool {
    match err.retry_class() {
      RetryClass::Transient => true,
      RetryClass::RateLimited => self.retry_rate_limited,
      RetryClass::Fatal => false,
    }
  }

  /// Runs `op` until it succeeds, fails with a non-retryable error, or the
  /// attempt budget is spent. `op` receives the 1-based attempt number.
  pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
  where
    E: Retryable + Display,
    F: FnMut(u32) -> Result<T, E>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;
    loop {
      match op(attempt) {
        Ok(v) => return Ok(v),
        Err(e) if attempt < max_attempts && self.should_retry(&e) => {
          let wait = self.backoff_for(attempt);
          tracing::warn!(
            operation = label,
            attempt,
            max_attempts,
            backoff_ms = wait.as_millis() as u64,
            error = %e,
            "retrying after backoff"
          );
          std::thread::sleep(wait);
          attempt += 1;
        }
        Err(e) => {
          if attempt > 1 {
            tracing::error!(operation = label, attempts = attempt, error = %e, "giving up");
          }
          return Err(e);
        }
      }
    }
  }
}
