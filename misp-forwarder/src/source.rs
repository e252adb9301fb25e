use crate::config::SourceConfig;
use crate::error::{endpoint_label, RemoteError, MISP};
use crate::retry::RetryPolicy;
use crate::types::RawIndicator;
use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Attribute kinds requested from MISP. `uri` is fetched but has no entity shape.
pub const SUPPORTED_KINDS: &[&str] = &[
  "ip-src", "ip-dst", "domain", "hostname", "md5", "sha1", "sha256", "url", "uri",
];

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time filter for a search. `until` closes the window at the cycle start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchWindow {
  pub since: Option<i64>,
  pub until: Option<i64>,
}

/// One search page. Records that do not fit the attribute shape are counted in
/// `rejected` instead of failing the whole page.
#[derive(Debug, Clone, Default)]
pub struct IndicatorPage {
  pub records: Vec<RawIndicator>,
  pub rejected: usize,
}

impl IndicatorPage {
  pub fn len(&self) -> usize {
    self.records.len() + self.rejected
  }

  /// True only when the server returned no attributes at all.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl From<Vec<RawIndicator>> for IndicatorPage {
  fn from(records: Vec<RawIndicator>) -> Self {
    Self {
      records,
      rejected: 0,
    }
  }
}

pub trait IndicatorSource {
  /// One page of published attributes. An empty page ends pagination.
  fn fetch(&self, window: FetchWindow, page: u32, limit: u32)
    -> Result<IndicatorPage, RemoteError>;
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
  page: u32,
  limit: u32,
  #[serde(rename = "returnFormat")]
  return_format: &'static str,
  #[serde(rename = "type")]
  kinds: &'a [&'a str],
  published: u8,
  #[serde(skip_serializing_if = "Option::is_none")]
  timestamp: Option<TimestampFilter>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum TimestampFilter {
  Since(i64),
  Range([i64; 2]),
}

impl FetchWindow {
  fn filter(&self) -> Option<TimestampFilter> {
    match (self.since, self.until) {
      (Some(since), Some(until)) => Some(TimestampFilter::Range([since, until])),
      (Some(since), None) => Some(TimestampFilter::Since(since)),
      (None, _) => None,
    }
  }
}

pub struct MispClient {
  http: Client,
  probe_http: Client,
  search_url: Url,
  version_url: Url,
  api_key: String,
  retry: RetryPolicy,
}

impl MispClient {
  pub fn new(cfg: &SourceConfig) -> anyhow::Result<Self> {
    let base = cfg.url.trim_end_matches('/');
    let search_url = Url::parse(&format!("{base}/attributes/restSearch"))
      .with_context(|| format!("invalid MISP URL: {}", cfg.url))?;
    let version_url = Url::parse(&format!("{base}/servers/getVersion"))
      .with_context(|| format!("invalid MISP URL: {}", cfg.url))?;

    let http = build_client(SEARCH_TIMEOUT, cfg.verify_tls)?;
    let probe_http = build_client(PROBE_TIMEOUT, cfg.verify_tls)?;
    if !cfg.verify_tls {
      tracing::warn!("TLS certificate verification for MISP is disabled");
    }

    Ok(Self {
      http,
      probe_http,
      search_url,
      version_url,
      api_key: cfg.api_key.clone(),
      retry: RetryPolicy::source(),
    })
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Connectivity check against `/servers/getVersion`. Never fatal.
  pub fn probe(&self) -> bool {
    let label = endpoint_label(&self.version_url);
    let res = self
      .probe_http
      .get(self.version_url.clone())
      .header(AUTHORIZATION, &self.api_key)
      .header(ACCEPT, "application/json")
      .header(USER_AGENT, user_agent())
      .send();

    match res {
      Ok(r) if r.status().is_success() => {
        tracing::info!(endpoint = %label, "connected to MISP");
        true
      }
      Ok(r) => {
        let err = RemoteError::from_status(MISP, &label, r.status().as_u16(), "");
        tracing::error!(error = %err, "MISP connectivity check failed; will keep retrying in the sync loop");
        false
      }
      Err(e) => {
        let err = RemoteError::transport(MISP, &label, e);
        tracing::error!(error = %err, "MISP connectivity check failed; will keep retrying in the sync loop");
        false
      }
    }
  }

  fn search_once(&self, body: &SearchRequest<'_>) -> Result<IndicatorPage, RemoteError> {
    let label = endpoint_label(&self.search_url);
    let response = self
      .http
      .post(self.search_url.clone())
      .header(AUTHORIZATION, &self.api_key)
      .header(ACCEPT, "application/json")
      .header(USER_AGENT, user_agent())
      .json(body)
      .send()
      .map_err(|e| RemoteError::transport(MISP, &label, e))?;

    let status = response.status().as_u16();
    if status != 200 {
      let text = response.text().unwrap_or_default();
      tracing::debug!(status, page = body.page, limit = body.limit, "MISP search failed");
      return Err(RemoteError::from_status(MISP, &label, status, &text));
    }

    let text = response
      .text()
      .map_err(|e| RemoteError::transport(MISP, &label, e))?;
    parse_attributes(&text).map_err(|detail| RemoteError::Malformed {
      service: MISP,
      endpoint: label,
      detail,
    })
  }
}

impl IndicatorSource for MispClient {
  fn fetch(
    &self,
    window: FetchWindow,
    page: u32,
    limit: u32,
  ) -> Result<IndicatorPage, RemoteError> {
    let body = SearchRequest {
      page,
      limit,
      return_format: "json",
      kinds: SUPPORTED_KINDS,
      published: 1,
      timestamp: window.filter(),
    };
    tracing::info!(page, limit, since = ?window.since, until = ?window.until, "requesting indicators from MISP");

    self.retry.run("misp search", |_| self.search_once(&body))
  }
}

/// `{response: {Attribute: [...]}}`; a missing list is an empty page.
/// Attributes that fail to decode are counted in `rejected`.
fn parse_attributes(text: &str) -> Result<IndicatorPage, String> {
  let doc: serde_json::Value =
    serde_json::from_str(text).map_err(|e| format!("invalid JSON: {e}"))?;
  let Some(list) = doc.get("response").and_then(|r| r.get("Attribute")) else {
    return Ok(IndicatorPage::default());
  };
  let items = list
    .as_array()
    .ok_or_else(|| "Attribute is not a list".to_string())?;

  let mut page = IndicatorPage::default();
  let mut last_error = None;
  for item in items {
    match RawIndicator::deserialize(item) {
      Ok(record) => page.records.push(record),
      Err(e) => {
        page.rejected += 1;
        last_error = Some(e);
      }
    }
  }
  if let Some(e) = last_error {
    tracing::warn!(rejected = page.rejected, error = %e, "skipping malformed MISP attributes");
  }
  Ok(page)
}

fn build_client(timeout: Duration, verify_tls: bool) -> anyhow::Result<Client> {
  Client::builder()
    .timeout(timeout)
    .danger_accept_invalid_certs(!verify_tls)
    .build()
    .context("build HTTP client")
}

fn user_agent() -> String {
  format!("misp-forwarder/{}", env!("CARGO_PKG_VERSION"))
}
