use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Parsed form of the `sync.historical_polling` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoricalPolicy {
  Disabled,
  Days(i64),
  Since(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
  #[error("historical polling date {0} is in the future")]
  FutureDate(NaiveDate),
  #[error("historical polling day count must not be negative (got {0})")]
  NegativeDays(i64),
  #[error("historical polling value {0:?} is neither a day count nor YYYY-MM-DD")]
  Unparsable(String),
}

const DISABLED_MARKERS: &[&str] = &["", "0", "0000-00-00", "disabled"];

impl HistoricalPolicy {
  pub fn parse(raw: &str, today: NaiveDate) -> Result<Self, PolicyError> {
    let val = raw.trim();
    if DISABLED_MARKERS.iter().any(|m| m.eq_ignore_ascii_case(val)) {
      return Ok(HistoricalPolicy::Disabled);
    }

    if let Ok(date) = NaiveDate::parse_from_str(val, "%Y-%m-%d") {
      if date > today {
        return Err(PolicyError::FutureDate(date));
      }
      return Ok(HistoricalPolicy::Since(date));
    }

    match val.parse::<i64>() {
      Ok(n) if n < 0 => Err(PolicyError::NegativeDays(n)),
      Ok(0) => Ok(HistoricalPolicy::Disabled),
      Ok(n) => Ok(HistoricalPolicy::Days(n)),
      Err(_) => Err(PolicyError::Unparsable(val.to_string())),
    }
  }

  pub fn offset_days(&self, now: DateTime<Utc>) -> i64 {
    match self {
      HistoricalPolicy::Disabled => 0,
      HistoricalPolicy::Days(n) => *n,
      HistoricalPolicy::Since(date) => {
        let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
          return 0;
        };
        (now - midnight.and_utc()).num_days().max(0)
      }
    }
  }
}

/// Resolves the configured value to a lookback in whole days. Anything invalid
/// is logged and treated as disabled.
pub fn resolve_offset_days(raw: &str, now: DateTime<Utc>) -> i64 {
  match HistoricalPolicy::parse(raw, now.date_naive()) {
    Ok(policy) => policy.offset_days(now),
    Err(e) => {
      tracing::warn!(error = %e, "historical polling disabled");
      0
    }
  }
}

/// Start watermark for a backfill, or `None` when backfill is disabled.
pub fn backfill_start(raw: &str, now: DateTime<Utc>) -> Option<i64> {
  let days = resolve_offset_days(raw, now);
  if days <= 0 {
    return None;
  }
  let start = Duration::try_days(days).and_then(|d| now.checked_sub_signed(d));
  match start {
    Some(ts) => Some(ts.timestamp()),
    None => {
      tracing::warn!(days, "historical polling lookback out of range; disabled");
      None
    }
  }
}

/// Watermark to use when no progress exists for the current policy.
pub fn initial_watermark(raw: &str, now: DateTime<Utc>) -> i64 {
  backfill_start(raw, now).unwrap_or_else(|| now.timestamp())
}
